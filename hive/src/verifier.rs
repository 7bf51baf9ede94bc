//! Commitment verification.
//!
//! Checks run on the blocking pool through a [`CheckRunner`], never inside
//! the agent's own execution path. The agent's claim of completion has no
//! bearing on the outcome: only the checks decide.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::core::commitment::{Check, CommitmentList, CommitmentStatus, VerificationResult};
use crate::io::checks::{CheckOutcome, CheckRequest, CheckRunner};

#[derive(Clone)]
pub struct Verifier {
    runner: Arc<dyn CheckRunner>,
    request: CheckRequest,
}

impl Verifier {
    pub fn new(runner: Arc<dyn CheckRunner>, request: CheckRequest) -> Self {
        Self { runner, request }
    }

    /// Run every check in order and record its status on the list.
    ///
    /// A check that errors, panics, or exceeds the timeout is `Failed`.
    /// An empty list passes.
    #[instrument(skip_all, fields(commitments = list.len()))]
    pub async fn verify_all(&self, list: &mut CommitmentList) -> VerificationResult {
        for commitment in list.items_mut().iter_mut() {
            commitment.record(CommitmentStatus::Verifying, None);
        }
        for commitment in list.items_mut().iter_mut() {
            let outcome = self.run_one(commitment.check().clone()).await;
            info!(
                commitment = commitment.description(),
                status = %outcome.status,
                "commitment checked"
            );
            commitment.record(outcome.status, outcome.detail);
        }
        VerificationResult::from_list(list)
    }

    async fn run_one(&self, check: Check) -> CheckOutcome {
        let runner = self.runner.clone();
        let request = self.request.clone();
        let timeout = request.timeout;
        let task = tokio::task::spawn_blocking(move || runner.run(&check, &request));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => {
                warn!(err = %err, "check could not run");
                CheckOutcome::failed(format!("check error: {err:#}"))
            }
            Ok(Err(join_err)) => {
                warn!(err = %join_err, "check panicked");
                CheckOutcome::failed("check panicked")
            }
            Err(_) => CheckOutcome::failed(format!("timed out after {}s", timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::core::commitment::Commitment;
    use crate::io::checks::ShellCheckRunner;
    use crate::test_support::ScriptedChecks;

    fn request(timeout: Duration) -> CheckRequest {
        CheckRequest {
            workdir: PathBuf::from("."),
            timeout,
            output_limit_bytes: 1000,
        }
    }

    fn list(commands: &[&str]) -> CommitmentList {
        CommitmentList::new(
            commands
                .iter()
                .map(|cmd| Commitment::new(format!("runs {cmd}"), Check::shell(*cmd)))
                .collect(),
        )
    }

    #[tokio::test]
    async fn all_passing_checks_pass() {
        let verifier = Verifier::new(Arc::new(ShellCheckRunner::default()), request(Duration::from_secs(5)));
        let mut commitments = list(&["true", "exit 0"]);
        let result = verifier.verify_all(&mut commitments).await;
        assert!(result.all_passed);
        assert_eq!(
            result.per_commitment,
            vec![CommitmentStatus::Passed, CommitmentStatus::Passed]
        );
    }

    #[tokio::test]
    async fn one_failure_fails_the_set() {
        let verifier = Verifier::new(Arc::new(ShellCheckRunner::default()), request(Duration::from_secs(5)));
        let mut commitments = list(&["true", "false", "true"]);
        let result = verifier.verify_all(&mut commitments).await;
        assert!(!result.all_passed);
        assert_eq!(
            result.per_commitment,
            vec![
                CommitmentStatus::Passed,
                CommitmentStatus::Failed,
                CommitmentStatus::Passed
            ]
        );
        assert_eq!(commitments.failed().count(), 1);
    }

    #[tokio::test]
    async fn empty_list_passes() {
        let verifier = Verifier::new(Arc::new(ScriptedChecks::new()), request(Duration::from_secs(1)));
        let mut commitments = CommitmentList::default();
        assert!(verifier.verify_all(&mut commitments).await.all_passed);
    }

    #[tokio::test]
    async fn slow_check_counts_as_failed() {
        let checks = ScriptedChecks::new().delay(Duration::from_millis(500));
        let verifier = Verifier::new(Arc::new(checks), request(Duration::from_millis(50)));
        let mut commitments = list(&["slow"]);
        let result = verifier.verify_all(&mut commitments).await;
        assert!(!result.all_passed);
        let detail = commitments.iter().next().and_then(|c| c.detail()).unwrap_or_default();
        assert!(detail.contains("timed out"));
    }

    #[tokio::test]
    async fn runner_error_counts_as_failed() {
        let verifier = Verifier::new(
            Arc::new(ShellCheckRunner::new(Vec::new())),
            request(Duration::from_secs(1)),
        );
        let mut commitments = list(&["true"]);
        let result = verifier.verify_all(&mut commitments).await;
        assert_eq!(result.per_commitment, vec![CommitmentStatus::Failed]);
    }
}
