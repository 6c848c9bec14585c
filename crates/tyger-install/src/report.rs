//! Outcome of draining a provisioning wave

use crate::error::{InstallError, Result};
use colored::Colorize;

/// Result of waiting for every promise in a wave
#[derive(Debug, Clone, Default)]
pub struct WaveReport {
    /// Promises that resolved successfully
    pub succeeded: usize,

    /// Promises that never ran because a prerequisite failed
    pub short_circuited: usize,

    /// Failures whose message was already surfaced by a nested wave
    pub already_reported: usize,

    /// Root-cause failures, in group order
    pub failures: Vec<InstallError>,

    /// Time spent draining the wave in milliseconds
    pub duration_ms: u64,
}

impl WaveReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.already_reported == 0
    }

    pub fn add_success(&mut self) {
        self.succeeded += 1;
    }

    pub fn add_failure(&mut self, err: InstallError) {
        match err {
            InstallError::DependencyFailed => self.short_circuited += 1,
            InstallError::AlreadyLogged => self.already_reported += 1,
            err => self.failures.push(err),
        }
    }

    /// Fold another wave's outcome into this one
    pub fn merge(&mut self, other: WaveReport) {
        self.succeeded += other.succeeded;
        self.short_circuited += other.short_circuited;
        self.already_reported += other.already_reported;
        self.failures.extend(other.failures);
        self.duration_ms = self.duration_ms.max(other.duration_ms);
    }

    pub fn log_failures(&self) {
        for err in &self.failures {
            log_error(err, "");
        }
    }

    /// Log root causes and convert to a single result
    pub fn into_result(self) -> Result<()> {
        self.log_failures();
        if self.is_success() {
            Ok(())
        } else {
            Err(InstallError::AlreadyLogged)
        }
    }
}

impl std::fmt::Display for WaveReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped in {}ms",
            self.succeeded,
            self.failures.len() + self.already_reported,
            self.short_circuited,
            self.duration_ms
        )
    }
}

/// Report an error once
///
/// Multi-line messages are hard to read inside a structured log line, so only
/// a headline goes through `tracing` and the body is written to stderr.
pub fn log_error(err: &InstallError, msg: &str) {
    let text = err.to_string();
    if text.contains('\n') {
        let headline = if msg.is_empty() {
            "Encountered error:"
        } else {
            msg
        };
        tracing::error!("{}", headline);
        eprintln!("{} {}", "Error:".red().bold(), text.red());
    } else if msg.is_empty() {
        tracing::error!(error = %text);
    } else {
        tracing::error!(error = %text, "{}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_failures() {
        let mut report = WaveReport::new();
        report.add_success();
        report.add_failure(InstallError::DependencyFailed);
        report.add_failure(InstallError::AlreadyLogged);
        report.add_failure(InstallError::provision("dns", "zone not found"));

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.short_circuited, 1);
        assert_eq!(report.already_reported, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.is_success());
    }

    #[test]
    fn test_short_circuits_alone_do_not_fail_a_wave() {
        let mut report = WaveReport::new();
        report.add_failure(InstallError::DependencyFailed);
        assert!(report.is_success());
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn test_already_reported_failure_fails_wave() {
        let mut report = WaveReport::new();
        report.add_failure(InstallError::AlreadyLogged);
        assert!(matches!(
            report.into_result(),
            Err(InstallError::AlreadyLogged)
        ));
    }

    #[test]
    fn test_merge_and_display() {
        let mut shared = WaveReport::new();
        shared.add_success();
        shared.duration_ms = 10;

        let mut org = WaveReport::new();
        org.add_success();
        org.add_failure(InstallError::DependencyFailed);
        org.add_failure(InstallError::provision("storage", "name taken"));
        org.duration_ms = 25;

        shared.merge(org);
        assert_eq!(shared.to_string(), "2 succeeded, 1 failed, 1 skipped in 25ms");
    }
}
