//! Sidecar I/O isolator.
//!
//! Each agent owns one sidecar task that performs its messenger calls. The
//! agent's actor never awaits the messenger: it hands a request to the
//! sidecar and keeps serving commands until the result comes back on a
//! channel. A process-wide [`CallGate`] bounds concurrent calls across all
//! agents; calls over the bound queue on the semaphore instead of failing.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::io::config::MessengerConfig;
use crate::io::messenger::{Messenger, MessengerError, MessengerReply};

/// Global bound on in-flight messenger calls.
#[derive(Debug, Clone)]
pub struct CallGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl CallGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.capacity
            .saturating_sub(self.semaphore.available_permits())
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }
}

/// Bounded exponential backoff between messenger attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &MessengerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("{source} (after {attempts} attempts)")]
    Exhausted {
        attempts: u32,
        #[source]
        source: MessengerError,
    },
    #[error("call cancelled")]
    Cancelled,
}

/// Shared call path: gate, per-attempt timeout, retries.
pub struct Sidecar {
    messenger: Arc<dyn Messenger>,
    gate: CallGate,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Sidecar {
    pub fn new(
        messenger: Arc<dyn Messenger>,
        gate: CallGate,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            messenger,
            gate,
            retry,
            attempt_timeout,
        }
    }

    pub fn gate(&self) -> &CallGate {
        &self.gate
    }

    /// Perform one logical call, retrying transient failures.
    ///
    /// The gate slot is held only while an attempt is running, never during
    /// backoff. Cancellation drops the in-flight attempt, which releases
    /// the slot.
    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    pub async fn call(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MessengerReply, CallError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                outcome = self.attempt(prompt, continuation_token) => outcome,
            };
            let err = match outcome {
                Ok(reply) => {
                    debug!(attempt, "messenger call succeeded");
                    return Ok(reply);
                }
                Err(err) => err,
            };
            if attempt >= self.retry.max_attempts {
                warn!(attempt, err = %err, "messenger attempts exhausted");
                return Err(CallError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            let delay = self.retry.delay(attempt);
            warn!(attempt, err = %err, delay_ms = delay.as_millis() as u64, "messenger call failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .ok_or_else(|| MessengerError::Unavailable("call gate closed".into()))?;
        match tokio::time::timeout(
            self.attempt_timeout,
            self.messenger.query(prompt, continuation_token),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(MessengerError::Timeout(self.attempt_timeout)),
        }
    }
}

/// Request handed from an agent to its sidecar.
#[derive(Debug)]
pub struct SidecarRequest {
    pub call_id: u64,
    pub prompt: String,
    pub continuation_token: Option<String>,
    pub cancel: CancellationToken,
}

/// Result handed back to the agent. `call_id` lets the agent drop results
/// for calls it has since abandoned.
#[derive(Debug)]
pub struct SidecarResult {
    pub call_id: u64,
    pub outcome: Result<MessengerReply, CallError>,
}

/// Per-agent sidecar task. Requests are served one at a time, so an agent
/// never overlaps its own calls.
#[derive(Debug)]
pub struct SidecarHandle {
    requests: mpsc::UnboundedSender<SidecarRequest>,
    shutdown: CancellationToken,
}

impl SidecarHandle {
    pub fn spawn(sidecar: Arc<Sidecar>, results: mpsc::UnboundedSender<SidecarResult>) -> Self {
        let (requests, mut rx) = mpsc::unbounded_channel::<SidecarRequest>();
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = stop.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };
                let outcome = sidecar
                    .call(
                        &request.prompt,
                        request.continuation_token.as_deref(),
                        &request.cancel,
                    )
                    .await;
                if results
                    .send(SidecarResult {
                        call_id: request.call_id,
                        outcome,
                    })
                    .is_err()
                {
                    break;
                }
            }
            debug!("sidecar stopped");
        });
        Self { requests, shutdown }
    }

    /// Queue a call. The returned token cancels just this call.
    pub fn request(
        &self,
        call_id: u64,
        prompt: String,
        continuation_token: Option<String>,
    ) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        let request = SidecarRequest {
            call_id,
            prompt,
            continuation_token,
            cancel: cancel.clone(),
        };
        if self.requests.send(request).is_err() {
            info!(call_id, "sidecar already stopped; call dropped");
        }
        cancel
    }

    /// Cancel any in-flight call and stop the task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SidecarHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CountingMessenger, ScriptStep, ScriptedMessenger};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base: Duration::from_millis(100),
            max: Duration::from_millis(250),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = policy(5);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(250));
        assert_eq!(policy.delay(30), Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let messenger = Arc::new(ScriptedMessenger::new().script(
            "hello",
            vec![ScriptStep::unavailable("flaky"), ScriptStep::text("DONE")],
        ));
        let sidecar = Sidecar::new(messenger.clone(), CallGate::new(1), policy(3), Duration::from_secs(5));
        let reply = sidecar
            .call("hello", None, &CancellationToken::new())
            .await
            .expect("call");
        assert_eq!(reply.text, "DONE");
        assert_eq!(messenger.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_surface_last_error() {
        let messenger = Arc::new(ScriptedMessenger::new().script(
            "hello",
            vec![ScriptStep::unavailable("down"), ScriptStep::unavailable("down")],
        ));
        let sidecar = Sidecar::new(messenger, CallGate::new(1), policy(2), Duration::from_secs(5));
        let err = sidecar
            .call("hello", None, &CancellationToken::new())
            .await
            .expect_err("exhausted");
        assert!(matches!(err, CallError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_times_out() {
        let messenger = Arc::new(ScriptedMessenger::new().script("hello", vec![ScriptStep::Hang]));
        let sidecar = Sidecar::new(messenger, CallGate::new(1), policy(1), Duration::from_secs(2));
        let err = sidecar
            .call("hello", None, &CancellationToken::new())
            .await
            .expect_err("timeout");
        assert_eq!(
            err,
            CallError::Exhausted {
                attempts: 1,
                source: MessengerError::Timeout(Duration::from_secs(2)),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_gate_slot() {
        let messenger = Arc::new(ScriptedMessenger::new().script("hello", vec![ScriptStep::Hang]));
        let gate = CallGate::new(1);
        let sidecar = Arc::new(Sidecar::new(messenger, gate.clone(), policy(1), Duration::from_secs(600)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SidecarHandle::spawn(sidecar, tx);

        let cancel = handle.request(7, "hello".into(), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.in_flight(), 1);

        cancel.cancel();
        let result = rx.recv().await.expect("result");
        assert_eq!(result.call_id, 7);
        assert_eq!(result.outcome, Err(CallError::Cancelled));
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn gate_bounds_concurrent_calls() {
        let messenger = Arc::new(CountingMessenger::new(Duration::from_millis(20), "ok"));
        let gate = CallGate::new(3);
        let sidecar = Arc::new(Sidecar::new(
            messenger.clone(),
            gate.clone(),
            policy(1),
            Duration::from_secs(5),
        ));
        let mut tasks = Vec::new();
        for _ in 0..12 {
            let sidecar = sidecar.clone();
            tasks.push(tokio::spawn(async move {
                sidecar.call("p", None, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("call");
        }
        assert_eq!(messenger.total_calls(), 12);
        assert!(messenger.max_in_flight() <= 3);
        assert_eq!(gate.in_flight(), 0);
    }
}
