//! Per-check error accumulation.
//!
//! A check collects its failures in an `ErrorLog` it owns and turns them into a single verdict at
//! the end, so nothing leaks between checks.

use itertools::Itertools;
use thiserror::Error;

use crate::executor::{RoundOutput, TIMEOUT_SENTINEL, UNREACHABLE_SENTINEL};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{} check(s) failed:\n{}", .0.len(), .0.join("\n"))]
pub struct CheckFailure(pub Vec<String>);

#[derive(Debug, Default, Clone)]
pub struct ErrorLog {
    errors: Vec<String>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and logs it.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.errors.push(message);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn clear(&mut self) {
        self.errors.clear();
    }

    /// Takes over every failure recorded in `other`.
    pub fn extend(&mut self, other: ErrorLog) {
        self.errors.extend(other.errors);
    }

    pub fn into_result(self) -> Result<(), CheckFailure> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(CheckFailure(self.errors))
        }
    }
}

/// Records a failure for every host whose output carries an abort sentinel.
/// Hosts are visited in name order. Returns how many were recorded.
pub fn scan_round(output: &RoundOutput, log: &mut ErrorLog) -> usize {
    let mut recorded = 0;
    for (host, text) in output.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        if text.ends_with(UNREACHABLE_SENTINEL) {
            log.fail(format!("Host {} is unreachable and was removed from the run", host));
        } else if text.contains(&format!("{}{}", TIMEOUT_SENTINEL, host)) {
            log.fail(format!("Host {} timed out", host));
        } else {
            continue;
        }
        recorded += 1;
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_passes() {
        assert!(ErrorLog::new().into_result().is_ok());
    }

    #[test]
    fn failures_are_kept_in_order() {
        let mut log = ErrorLog::new();
        log.fail("first");
        log.fail("second");
        let err = log.into_result().unwrap_err();
        assert_eq!(err.0, vec!["first", "second"]);
        assert!(err.to_string().starts_with("2 check(s) failed"));
    }

    #[test]
    fn clear_resets_between_checks() {
        let mut log = ErrorLog::new();
        log.fail("stale");
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn extend_merges_logs() {
        let mut outer = ErrorLog::new();
        let mut inner = ErrorLog::new();
        inner.fail("inner");
        outer.extend(inner);
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn scan_flags_sentinels() {
        let mut output = RoundOutput::new();
        output.insert("h1".into(), "ok\n".into());
        output.insert(
            "h2".into(),
            "Command timed out\nABORT: Timeout Error in Host: h2\n".into(),
        );
        output.insert(
            "h3".into(),
            "Connection failed\n\nABORT: Host Unreachable Error".into(),
        );
        let mut log = ErrorLog::new();
        assert_eq!(scan_round(&output, &mut log), 2);
        assert_eq!(
            log.errors(),
            &[
                "Host h2 timed out".to_string(),
                "Host h3 is unreachable and was removed from the run".to_string(),
            ]
        );
    }
}
