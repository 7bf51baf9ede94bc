//! Test-only messengers, check runners, and an orchestrator harness.
//!
//! Scripted collaborators never spawn processes, so lifecycle tests are
//! deterministic and fast.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::commitment::Check;
use crate::io::checks::{CheckOutcome, CheckRequest, CheckRunner};
use crate::io::config::HiveConfig;
use crate::io::messenger::{Messenger, MessengerError, MessengerReply};
use crate::io::store::MemoryStore;
use crate::orchestrator::{Orchestrator, Services};

/// One scripted messenger response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply { text: String, tokens: Option<u64> },
    Delayed { delay: Duration, text: String },
    Fail(String),
    /// Never returns; only a timeout or cancellation ends the call.
    Hang,
}

impl ScriptStep {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptStep::Reply {
            text: text.into(),
            tokens: None,
        }
    }

    pub fn usage(text: impl Into<String>, tokens: u64) -> Self {
        ScriptStep::Reply {
            text: text.into(),
            tokens: Some(tokens),
        }
    }

    pub fn delayed(delay: Duration, text: impl Into<String>) -> Self {
        ScriptStep::Delayed {
            delay,
            text: text.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        ScriptStep::Fail(reason.into())
    }
}

struct Script {
    key: String,
    steps: VecDeque<ScriptStep>,
    served: usize,
}

/// Messenger that replays per-conversation scripts.
///
/// A conversation starts on the first script whose key appears in the
/// prompt. Replies carry a `key#n` continuation token so later calls stay on
/// the same script. Exhausted or unmatched conversations get the fallback
/// reply, or `Unavailable` when none is set.
#[derive(Default)]
pub struct ScriptedMessenger {
    scripts: Mutex<Vec<Script>>,
    fallback: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, key: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.push(Script {
                key: key.into(),
                steps: steps.into(),
                served: 0,
            });
        }
        self
    }

    pub fn reply_with(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// Total calls received, including failed attempts.
    pub fn calls(&self) -> usize {
        self.prompts().len()
    }

    /// Every prompt received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    fn next_step(&self, prompt: &str, token: Option<&str>) -> (Option<ScriptStep>, String) {
        let Ok(mut scripts) = self.scripts.lock() else {
            return (None, "fallback".to_string());
        };
        let by_token = token
            .and_then(|token| token.split_once('#'))
            .and_then(|(key, _)| scripts.iter().position(|s| s.key == key));
        let index = by_token.or_else(|| scripts.iter().position(|s| prompt.contains(&s.key)));
        match index {
            Some(index) => {
                let script = &mut scripts[index];
                script.served += 1;
                let token = format!("{}#{}", script.key, script.served);
                (script.steps.pop_front(), token)
            }
            None => (None, "fallback".to_string()),
        }
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn query(
        &self,
        prompt: &str,
        continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let (step, token) = self.next_step(prompt, continuation_token);
        match step {
            Some(ScriptStep::Reply { text, tokens }) => {
                let reply = MessengerReply::text(text).with_token(token);
                Ok(match tokens {
                    Some(tokens) => reply.with_usage(tokens),
                    None => reply,
                })
            }
            Some(ScriptStep::Delayed { delay, text }) => {
                tokio::time::sleep(delay).await;
                Ok(MessengerReply::text(text).with_token(token))
            }
            Some(ScriptStep::Fail(reason)) => Err(MessengerError::Unavailable(reason)),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => match &self.fallback {
                Some(text) => Ok(MessengerReply::text(text.clone()).with_token(token)),
                None => Err(MessengerError::Unavailable("script exhausted".to_string())),
            },
        }
    }
}

/// Messenger that sleeps, then answers, recording peak concurrency.
pub struct CountingMessenger {
    delay: Duration,
    reply: String,
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl CountingMessenger {
    pub fn new(delay: Duration, reply: impl Into<String>) -> Self {
        Self {
            delay,
            reply: reply.into(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Messenger for CountingMessenger {
    async fn query(
        &self,
        _prompt: &str,
        _continuation_token: Option<&str>,
    ) -> Result<MessengerReply, MessengerError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(MessengerReply::text(self.reply.clone()))
    }
}

/// Check runner with per-check outcome sequences. Unscripted checks pass.
///
/// The last outcome of a sequence repeats once the others are used up.
#[derive(Default)]
pub struct ScriptedChecks {
    outcomes: Mutex<HashMap<String, VecDeque<CheckOutcome>>>,
    runs: Mutex<HashMap<String, usize>>,
    delay: Option<Duration>,
}

impl ScriptedChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block each check for `delay` before answering.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Outcomes for the shell check running `command`, in order.
    pub fn outcomes(self, command: impl Into<String>, outcomes: Vec<CheckOutcome>) -> Self {
        if let Ok(mut map) = self.outcomes.lock() {
            map.insert(command.into(), outcomes.into());
        }
        self
    }

    /// How many times the check keyed by `command` ran.
    pub fn runs(&self, command: &str) -> usize {
        self.runs
            .lock()
            .map(|runs| runs.get(command).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

fn check_key(check: &Check) -> String {
    match check {
        Check::Shell { command } => command.clone(),
        Check::PathExists { path } => path.display().to_string(),
    }
}

impl CheckRunner for ScriptedChecks {
    fn run(&self, check: &Check, _request: &CheckRequest) -> Result<CheckOutcome> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let key = check_key(check);
        if let Ok(mut runs) = self.runs.lock() {
            *runs.entry(key.clone()).or_default() += 1;
        }
        let mut outcomes = self
            .outcomes
            .lock()
            .map_err(|_| anyhow::anyhow!("scripted checks poisoned"))?;
        let outcome = match outcomes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(outcome.unwrap_or_else(CheckOutcome::passed))
    }
}

/// Defaults tuned for tests: quick retries, no auto-continue.
pub fn test_config() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.messenger.timeout_secs = 5;
    config.messenger.max_attempts = 2;
    config.messenger.backoff_base_ms = 1;
    config.messenger.backoff_max_ms = 5;
    config.messenger.max_in_flight = 4;
    config.verifier.timeout_secs = 5;
    config.lifecycle.input_timeout_secs = 60;
    config.lifecycle.auto_continue = false;
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<MemoryStore>,
    pub workdir: TempDir,
}

/// Start an orchestrator over an in-memory store and scripted collaborators.
pub async fn harness<M, C>(config: HiveConfig, messenger: Arc<M>, checks: Arc<C>) -> Harness
where
    M: Messenger + 'static,
    C: CheckRunner + 'static,
{
    let workdir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::start(
        &config,
        workdir.path().to_path_buf(),
        Services {
            store: store.clone(),
            messenger,
            checks,
        },
    )
    .expect("start orchestrator");
    Harness {
        orchestrator,
        store,
        workdir,
    }
}
