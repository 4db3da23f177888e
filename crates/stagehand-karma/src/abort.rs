//! Abort-on-failure policy.

use async_trait::async_trait;
use stagehand_core::{AbortSignal, Advice, AdviceError, AdviceResult, Spec};
use tracing::warn;

use crate::outcome::RecordedOutcome;

/// Advice that halts the pipeline after a failed test run.
///
/// Does nothing when no run has been recorded or the run passed. When
/// `abort_on_test_failure` is false the failure is only logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortController;

impl AbortController {
    pub const NAME: &'static str = "abort-on-test-failure";
}

#[async_trait]
impl Advice for AbortController {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(&self, spec: &mut Spec) -> AdviceResult {
        let Some(outcome) = RecordedOutcome::read(spec) else {
            return Ok(());
        };
        if outcome.passed {
            return Ok(());
        }

        if spec.abort_on_test_failure() {
            return Err(AdviceError::Abort(
                AbortSignal::new("test run failed").with_return_code(outcome.return_code),
            ));
        }

        warn!(
            return_code = outcome.return_code,
            "Test run failed; continuing because errors are ignored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys;
    use serde_json::json;

    fn failed_spec() -> Spec {
        Spec::from_entries([
            (keys::KARMA_RETURN_CODE, json!(2)),
            (keys::KARMA_TEST_PASSED, json!(false)),
        ])
    }

    #[tokio::test]
    async fn test_aborts_on_failure_by_default() {
        let mut spec = failed_spec();
        let err = AbortController.apply(&mut spec).await.unwrap_err();
        match err {
            AdviceError::Abort(signal) => assert_eq!(signal.return_code, Some(2)),
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_continues_when_ignoring_errors() {
        let mut spec = failed_spec();
        spec.set_abort_on_test_failure(false);
        AbortController.apply(&mut spec).await.unwrap();
    }

    #[tokio::test]
    async fn test_noop_without_run_or_on_pass() {
        AbortController.apply(&mut Spec::new()).await.unwrap();

        let mut passed = Spec::from_entries([(keys::KARMA_RETURN_CODE, json!(0))]);
        AbortController.apply(&mut passed).await.unwrap();
    }
}
