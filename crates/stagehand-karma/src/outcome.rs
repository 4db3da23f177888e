//! Run outcome of the external test runner, stored as Spec keys.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stagehand_core::Spec;
use uuid::Uuid;

use crate::keys;

/// How to judge a run in which the runner executed zero tests.
///
/// Only consulted when the runner wrote a result summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyRunPolicy {
    /// The runner's exit code decides.
    #[default]
    Runner,
    Pass,
    Fail,
}

impl FromStr for EmptyRunPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runner" => Ok(EmptyRunPolicy::Runner),
            "pass" => Ok(EmptyRunPolicy::Pass),
            "fail" => Ok(EmptyRunPolicy::Fail),
            other => Err(format!(
                "unknown empty run policy '{}' (expected runner, pass or fail)",
                other
            )),
        }
    }
}

impl fmt::Display for EmptyRunPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmptyRunPolicy::Runner => "runner",
            EmptyRunPolicy::Pass => "pass",
            EmptyRunPolicy::Fail => "fail",
        })
    }
}

/// Machine-readable test counts written by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub executed: u32,
    pub passed: u32,
    pub failed: u32,

    #[serde(default)]
    pub skipped: u32,
}

/// Result of one external run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,

    /// Process exit code; `-1` when the process was killed by a signal.
    pub return_code: i32,

    pub passed: bool,
    pub summary: Option<RunSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Reports produced by the run (coverage directories).
    pub artifacts: Vec<PathBuf>,
}

impl RunOutcome {
    /// Decide pass/fail from the exit code and optional summary.
    pub fn judge(return_code: i32, summary: Option<&RunSummary>, policy: EmptyRunPolicy) -> bool {
        match summary {
            Some(summary) if summary.executed == 0 => match policy {
                EmptyRunPolicy::Runner => return_code == 0,
                EmptyRunPolicy::Pass => true,
                EmptyRunPolicy::Fail => false,
            },
            Some(summary) => return_code == 0 && summary.failed == 0,
            None => return_code == 0,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// Record this outcome in the Spec.
    ///
    /// Artifact keys are only written for passing runs.
    pub fn write_to(&self, spec: &mut Spec) {
        spec.set(keys::KARMA_RUN_ID, self.run_id.to_string());
        spec.set(keys::KARMA_RETURN_CODE, self.return_code);
        spec.set(keys::KARMA_TEST_PASSED, self.passed);
        spec.set(keys::KARMA_STARTED_AT, self.started_at.to_rfc3339());
        spec.set(keys::KARMA_FINISHED_AT, self.finished_at.to_rfc3339());
        match &self.summary {
            Some(summary) => spec.set(keys::KARMA_RUN_SUMMARY, json!(summary)),
            None => {
                spec.pop(keys::KARMA_RUN_SUMMARY);
            }
        }
        if self.passed && !self.artifacts.is_empty() {
            let paths: Vec<Value> = self
                .artifacts
                .iter()
                .map(|p| Value::from(p.to_string_lossy().into_owned()))
                .collect();
            spec.set(keys::COVERAGE_REPORTS, Value::Array(paths));
        }
    }
}

/// The minimal outcome view other advices rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub return_code: i32,
    pub passed: bool,
}

impl RecordedOutcome {
    /// Read the recorded outcome, if a run has written one.
    ///
    /// A missing pass flag is derived from the return code.
    pub fn read(spec: &Spec) -> Option<Self> {
        let return_code = i32::try_from(spec.get_i64(keys::KARMA_RETURN_CODE)?).unwrap_or(-1);
        let passed = spec
            .get_bool(keys::KARMA_TEST_PASSED)
            .unwrap_or(return_code == 0);
        Some(Self {
            return_code,
            passed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(executed: u32, failed: u32) -> RunSummary {
        RunSummary {
            executed,
            passed: executed - failed,
            failed,
            skipped: 0,
        }
    }

    #[test]
    fn test_exit_code_governs_without_summary() {
        assert!(RunOutcome::judge(0, None, EmptyRunPolicy::Fail));
        assert!(!RunOutcome::judge(1, None, EmptyRunPolicy::Pass));
    }

    #[test]
    fn test_empty_run_policies() {
        let empty = summary(0, 0);
        assert!(!RunOutcome::judge(1, Some(&empty), EmptyRunPolicy::Runner));
        assert!(RunOutcome::judge(0, Some(&empty), EmptyRunPolicy::Runner));
        assert!(RunOutcome::judge(1, Some(&empty), EmptyRunPolicy::Pass));
        assert!(!RunOutcome::judge(0, Some(&empty), EmptyRunPolicy::Fail));
    }

    #[test]
    fn test_reported_failures_never_pass() {
        assert!(!RunOutcome::judge(0, Some(&summary(4, 1)), EmptyRunPolicy::Runner));
        assert!(RunOutcome::judge(0, Some(&summary(4, 0)), EmptyRunPolicy::Runner));
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("pass".parse::<EmptyRunPolicy>(), Ok(EmptyRunPolicy::Pass));
        assert_eq!(EmptyRunPolicy::default().to_string(), "runner");
        assert!("maybe".parse::<EmptyRunPolicy>().is_err());
    }

    #[test]
    fn test_write_and_read_back() {
        let now = Utc::now();
        let outcome = RunOutcome {
            run_id: Uuid::new_v4(),
            return_code: 3,
            passed: false,
            summary: Some(summary(2, 2)),
            started_at: now,
            finished_at: now,
            artifacts: vec![PathBuf::from("coverage")],
        };

        let mut spec = Spec::new();
        outcome.write_to(&mut spec);

        assert_eq!(
            RecordedOutcome::read(&spec),
            Some(RecordedOutcome {
                return_code: 3,
                passed: false
            })
        );
        assert_eq!(spec.get(keys::KARMA_RUN_SUMMARY).unwrap()["failed"], 2);
        // Failing runs publish no downstream artifacts.
        assert!(!spec.contains(keys::COVERAGE_REPORTS));
    }

    #[test]
    fn test_read_without_outcome() {
        assert_eq!(RecordedOutcome::read(&Spec::new()), None);
    }
}
