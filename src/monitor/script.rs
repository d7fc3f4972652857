//! Bash rendition of the monitor, deployed next to the helpers.

use std::time::Duration;

use camino::Utf8PathBuf;

use super::{DEFAULT_LOG_FILE, DEFAULT_POLL_INTERVAL, KNOWN_SHELLS};
use crate::shell::ShellVariant;
use crate::util::quote_path;
use crate::workspace::RemoteWorkspace;

const TEMPLATE: &str = r#"#!/bin/bash
# sshrc session monitor: restores shell configuration and removes the
# workspace once the owning terminal session ends.
# Usage: ssh-mon.bash [TTY]

LOG_FILE=@LOG_FILE@
WORKSPACE=@WORKSPACE@
POLL_INTERVAL=@POLL_INTERVAL@
MONITOR_USER="${USER:-$(id -un 2>/dev/null)}"

log_line() {
    printf '[%s] %s\n' "$(date '+%Y-%m-%d %H:%M:%S')" "$1" >> "$LOG_FILE" 2>/dev/null || true
}

if [ -n "$1" ]; then
    MONITOR_TTY="$1"
elif [ -n "$SSH_TTY" ]; then
    MONITOR_TTY="$SSH_TTY"
else
    log_line "ERROR: No TTY specified and SSH_TTY not set"
    exit 1
fi

TTY_NAME="${MONITOR_TTY#/dev/}"
START_TIME=$(date +%s)
log_line "Started monitoring SSH session for user $MONITOR_USER on TTY $MONITOR_TTY"

format_duration() {
    local total=$1
    local hours=$((total / 3600))
    local minutes=$(((total % 3600) / 60))
    local seconds=$((total % 60))
    if [ "$hours" -gt 0 ]; then
        echo "${hours}h ${minutes}m ${seconds}s"
    elif [ "$minutes" -gt 0 ]; then
        echo "${minutes}m ${seconds}s"
    else
        echo "${seconds}s"
    fi
}

shell_on_tty() {
    ps -u "$MONITOR_USER" -o tty=,comm= 2>/dev/null |
        awk -v tty="$TTY_NAME" '$1 == tty && $2 ~ /^-?(@SHELLS@)$/ { found = 1 } END { exit !found }'
}

restore() {
@RESTORE@    rm -rf "$WORKSPACE" 2>/dev/null || true
}

while true; do
    if [ ! -e "$MONITOR_TTY" ]; then
        REASON="TTY device $MONITOR_TTY no longer exists"
        break
    fi
    if ! shell_on_tty; then
        REASON="No shell process found on TTY $MONITOR_TTY"
        break
    fi
    sleep "$POLL_INTERVAL"
done

END_TIME=$(date +%s)
log_line "SSH session ended - $REASON (Duration: $(format_duration $((END_TIME - START_TIME))))"
restore
exit 0
"#;

/// Renders the monitor as a standalone bash script.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MonitorScript {
    workspace: RemoteWorkspace,
    log_file: Utf8PathBuf,
    poll_interval: Duration,
}

impl MonitorScript {
    /// Creates a script for `workspace` with the default log file and poll
    /// interval.
    #[must_use]
    pub fn new(workspace: RemoteWorkspace) -> Self {
        Self {
            workspace,
            log_file: Utf8PathBuf::from(DEFAULT_LOG_FILE),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the log file.
    #[must_use]
    pub fn with_log_file(mut self, log_file: impl Into<Utf8PathBuf>) -> Self {
        self.log_file = log_file.into();
        self
    }

    /// Overrides the poll interval; sub-second parts are rounded up.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Returns the script text.
    #[must_use]
    pub fn render(&self) -> String {
        let restore: String = ShellVariant::ALL
            .iter()
            .map(|variant| {
                format!(
                    "    mv -f \"$HOME/{backup}\" \"$HOME/{rc}\" 2>/dev/null || true\n",
                    backup = variant.backup_file_name(),
                    rc = variant.rc_file_name(),
                )
            })
            .collect();

        TEMPLATE
            .replace("@LOG_FILE@", &quote_path(&self.log_file))
            .replace("@WORKSPACE@", &quote_path(self.workspace.root()))
            .replace("@POLL_INTERVAL@", &self.poll_seconds().to_string())
            .replace("@SHELLS@", &KNOWN_SHELLS.join("|"))
            .replace("@RESTORE@", &restore)
    }

    fn poll_seconds(&self) -> u64 {
        let whole = self.poll_interval.as_secs();
        let rounded = if self.poll_interval.subsec_nanos() > 0 {
            whole.saturating_add(1)
        } else {
            whole
        };
        rounded.max(1)
    }
}
