//! Spawn result types

use crate::spec::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exit code reported for a process that died from `signal`, shell style.
#[must_use]
pub const fn signal_exit_code(signal: i32) -> i32 {
    128 + signal
}

/// Result of one supervised spawn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    /// Exit code of the action; `128 + n` when it died from signal `n`
    pub exit_code: i32,

    /// Signal that ended the process, when one did
    pub signal: Option<i32>,

    /// Whether the deadline elapsed and the process tree was terminated
    pub timed_out: bool,

    /// Whether the caller cancelled the spawn
    pub cancelled: bool,

    /// Standard output
    pub stdout: Vec<u8>,

    /// Standard error
    pub stderr: Vec<u8>,

    /// Stdout exceeded the output limit and was cut
    pub stdout_truncated: bool,

    /// Stderr exceeded the output limit and was cut
    pub stderr_truncated: bool,

    /// Wall-clock time from process start to reap
    pub wall_time: Duration,

    /// Deadline the spawn ran under
    pub timeout: Duration,

    /// Isolation level the action actually ran with
    pub isolation: IsolationLevel,
}

impl SpawnResult {
    /// Get stdout as UTF-8 string, lossy conversion
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Get stderr as UTF-8 string, lossy conversion
    #[must_use]
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Check if the spawn was successful (exit code 0, not timed out or cancelled)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }

    /// One-line description suitable for user-facing diagnostics
    #[must_use]
    pub fn summary(&self) -> String {
        if self.timed_out {
            format!(
                "timed out after {:.3}s (deadline {:.3}s), exit code {}",
                self.wall_time.as_secs_f64(),
                self.timeout.as_secs_f64(),
                self.exit_code
            )
        } else if self.cancelled {
            format!(
                "cancelled after {:.3}s, exit code {}",
                self.wall_time.as_secs_f64(),
                self.exit_code
            )
        } else if let Some(signal) = self.signal {
            format!(
                "killed by signal {signal} after {:.3}s",
                self.wall_time.as_secs_f64()
            )
        } else {
            format!(
                "exited with code {} after {:.3}s (isolation: {})",
                self.exit_code,
                self.wall_time.as_secs_f64(),
                self.isolation
            )
        }
    }
}

impl Default for SpawnResult {
    fn default() -> Self {
        Self {
            exit_code: -1,
            signal: None,
            timed_out: false,
            cancelled: false,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            wall_time: Duration::ZERO,
            timeout: Duration::ZERO,
            isolation: IsolationLevel::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_summary_names_elapsed_and_deadline() {
        let result = SpawnResult {
            exit_code: signal_exit_code(9),
            signal: Some(9),
            timed_out: true,
            wall_time: Duration::from_millis(1_250),
            timeout: Duration::from_secs(1),
            ..SpawnResult::default()
        };
        assert!(!result.is_success());
        let summary = result.summary();
        assert!(summary.contains("1.250s"), "{summary}");
        assert!(summary.contains("deadline 1.000s"), "{summary}");
    }

    #[test]
    fn success_requires_zero_exit_and_no_interruption() {
        let mut result = SpawnResult {
            exit_code: 0,
            ..SpawnResult::default()
        };
        assert!(result.is_success());
        result.cancelled = true;
        assert!(!result.is_success());
    }
}
