//! Agents.
//!
//! Each agent is an actor: one tokio task owns every piece of its mutable
//! state and applies commands strictly one at a time, so transitions are
//! serialized without a lock. The actor never awaits I/O. Messenger calls go
//! to the agent's sidecar and verification runs on its own task; both report
//! back over channels. Everything else talks to the agent through a cheap,
//! cloneable [`AgentHandle`], and reads its state from a watch channel that
//! never blocks on the actor.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::budget::{BudgetStatus, TokenBudget, estimate_tokens};
use crate::core::classifier::SignalClassifier;
use crate::core::commitment::{
    Commitment, CommitmentList, CommitmentStatus, VerificationResult, parse_declared,
};
use crate::core::lifecycle::Lifecycle;
use crate::core::spin::SpinDetector;
use crate::core::types::{AgentId, AgentKind, AgentState, DoneBehavior, ReapReason, Signal};
use crate::events::{BubbledMessage, Destination, EventBus, MessageKind, Notification};
use crate::io::config::HiveConfig;
use crate::io::prompt::{AssignmentPrompt, PromptEngine};
use crate::io::records::{AgentRecord, write_agent, write_commitments};
use crate::io::store::Store;
use crate::orchestrator::ToolError;
use crate::registry::Registry;
use crate::sidecar::{CallError, Sidecar, SidecarHandle, SidecarResult};
use crate::verifier::Verifier;

const MAX_NOTICES: usize = 32;

/// Who sent an input, and so who hears about it if it is never processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Agent(AgentId),
}

impl Origin {
    fn destination(self) -> Destination {
        match self {
            Origin::User => Destination::User,
            Origin::Agent(id) => Destination::Agent(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Input {
    pub origin: Origin,
    pub origin_name: String,
    pub text: String,
}

/// A bubbled message in transit between agents.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: AgentId,
    pub origin_name: String,
    pub destination: Destination,
    pub message: BubbledMessage,
}

/// A bubbled message as seen by an agent it passed through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub from: AgentId,
    pub from_name: String,
    pub message: BubbledMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Dismissal {
    Dismissed,
    /// The agent is verifying; the reap applies once verification resolves.
    Deferred,
}

pub(crate) enum AgentCommand {
    Message(Input),
    Bubble(Envelope),
    Reap(ReapReason),
    Dismiss(oneshot::Sender<Dismissal>),
    AddCommitment {
        commitment: Commitment,
        reply: oneshot::Sender<Result<(), ToolError>>,
    },
    AttachChild {
        child: AgentId,
        reply: oneshot::Sender<bool>,
    },
    DetachChild(AgentId),
}

/// Point-in-time view of one agent, published after every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub state: AgentState,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
    pub assignment: Option<String>,
    pub tokens_used: u64,
    pub token_budget: Option<u64>,
    pub commitments: CommitmentList,
    pub queued: usize,
    pub call_in_flight: bool,
    pub reap_reason: Option<ReapReason>,
    pub notices: Vec<Notice>,
    pub last_reply: Option<String>,
    pub retired: bool,
}

/// Everything needed to bring an agent to life.
#[derive(Debug, Clone)]
pub struct AgentInit {
    pub id: AgentId,
    pub name: String,
    pub kind: AgentKind,
    pub parent: Option<AgentId>,
    pub children: Vec<AgentId>,
    pub assignment: Option<String>,
    pub commitments: CommitmentList,
    pub token_budget: Option<u64>,
    pub tokens_used: u64,
    pub done_behavior: DoneBehavior,
    pub continuation_token: Option<String>,
    pub lifecycle: Lifecycle,
}

impl AgentInit {
    pub fn record(&self) -> AgentRecord {
        AgentRecord {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.lifecycle.state(),
            assignment: self.assignment.clone(),
            parent: self.parent,
            children: self.children.clone(),
            continuation_token: self.continuation_token.clone(),
            token_budget: self.token_budget,
            tokens_used: self.tokens_used,
            done_behavior: self.done_behavior,
            retired: false,
            reap_reason: None,
            transitions: self.lifecycle.history().to_vec(),
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.lifecycle.state(),
            parent: self.parent,
            children: self.children.clone(),
            assignment: self.assignment.clone(),
            tokens_used: self.tokens_used,
            token_budget: self.token_budget,
            commitments: self.commitments.clone(),
            queued: 0,
            call_in_flight: false,
            reap_reason: None,
            notices: Vec::new(),
            last_reply: None,
            retired: false,
        }
    }
}

/// Per-agent knobs derived from [`HiveConfig`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub workdir: PathBuf,
    pub input_timeout: Duration,
    pub spin_threshold: usize,
    pub auto_continue: bool,
    pub commitment_prefix: String,
}

impl AgentSettings {
    pub fn from_config(config: &HiveConfig, workdir: PathBuf) -> Self {
        Self {
            workdir,
            input_timeout: config.input_timeout(),
            spin_threshold: config.lifecycle.spin_threshold,
            auto_continue: config.lifecycle.auto_continue,
            commitment_prefix: config.classifier.commitment_prefix.clone(),
        }
    }
}

/// Process-wide services shared by every agent.
#[derive(Clone)]
pub struct AgentContext {
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    pub store: Arc<dyn Store>,
    pub sidecar: Arc<Sidecar>,
    pub verifier: Verifier,
    pub prompts: Arc<PromptEngine>,
    pub classifier: Arc<dyn SignalClassifier>,
    pub settings: AgentSettings,
}

struct HandleInner {
    id: AgentId,
    name: String,
    kind: AgentKind,
    parent: Option<AgentId>,
    commands: mpsc::UnboundedSender<AgentCommand>,
    snapshot: watch::Receiver<AgentSnapshot>,
}

#[derive(Clone)]
pub struct AgentHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn kind(&self) -> AgentKind {
        self.inner.kind
    }

    pub fn parent(&self) -> Option<AgentId> {
        self.inner.parent
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn state(&self) -> AgentState {
        self.inner.snapshot.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<AgentSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Wait until the agent's snapshot satisfies `predicate`.
    ///
    /// Fails with `AgentGone` if the agent exits without ever matching.
    pub async fn wait_for<F>(&self, predicate: F) -> Result<AgentSnapshot, ToolError>
    where
        F: FnMut(&AgentSnapshot) -> bool,
    {
        let mut rx = self.inner.snapshot.clone();
        rx.wait_for(predicate)
            .await
            .map(|snapshot| snapshot.clone())
            .map_err(|_| ToolError::AgentGone(self.id()))
    }

    fn command(&self, command: AgentCommand) -> Result<(), ToolError> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| ToolError::AgentGone(self.id()))
    }

    /// Deliver an input. Terminal agents refuse it up front; inputs that are
    /// queued and later dropped come back to the origin as delivery failures.
    pub fn send(&self, origin: Origin, origin_name: &str, text: &str) -> Result<(), ToolError> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ToolError::AgentTerminal {
                id: self.id(),
                state,
            });
        }
        self.command(AgentCommand::Message(Input {
            origin,
            origin_name: origin_name.to_string(),
            text: text.to_string(),
        }))
    }

    pub(crate) fn bubble(&self, envelope: Envelope) -> Result<(), ToolError> {
        self.command(AgentCommand::Bubble(envelope))
    }

    /// Ask the agent to reap itself. Returns false if it has already exited.
    pub fn reap(&self, reason: ReapReason) -> bool {
        self.command(AgentCommand::Reap(reason)).is_ok()
    }

    pub async fn dismiss(&self) -> Result<Dismissal, ToolError> {
        if self.kind().is_immortal() {
            return Err(ToolError::RootImmortal);
        }
        let (reply, rx) = oneshot::channel();
        self.command(AgentCommand::Dismiss(reply))?;
        rx.await.map_err(|_| ToolError::AgentGone(self.id()))
    }

    pub async fn add_commitment(&self, commitment: Commitment) -> Result<(), ToolError> {
        let (reply, rx) = oneshot::channel();
        self.command(AgentCommand::AddCommitment { commitment, reply })?;
        rx.await.map_err(|_| ToolError::AgentGone(self.id()))?
    }

    /// Record `child` under this agent. False if the agent can no longer
    /// take children.
    pub(crate) async fn attach_child(&self, child: AgentId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.command(AgentCommand::AttachChild { child, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub(crate) fn detach_child(&self, child: AgentId) {
        if self.command(AgentCommand::DetachChild(child)).is_err() {
            debug!(agent = %self.id(), %child, "detach skipped; agent already exited");
        }
    }

    /// A handle with no actor behind it, for registry tests.
    #[cfg(test)]
    pub(crate) fn detached(
        name: &str,
        kind: AgentKind,
    ) -> (Self, mpsc::UnboundedReceiver<AgentCommand>) {
        let init = AgentInit {
            id: AgentId::new(),
            name: name.to_string(),
            kind,
            parent: None,
            children: Vec::new(),
            assignment: None,
            commitments: CommitmentList::default(),
            token_budget: None,
            tokens_used: 0,
            done_behavior: DoneBehavior::default(),
            continuation_token: None,
            lifecycle: Lifecycle::new(),
        };
        let (commands, rx) = mpsc::unbounded_channel();
        let (_tx, snapshot) = watch::channel(init.snapshot());
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: init.id,
                name: init.name,
                kind,
                parent: None,
                commands,
                snapshot,
            }),
        };
        (handle, rx)
    }
}

struct InFlight {
    call_id: u64,
    prompt: String,
    cancel: CancellationToken,
}

struct Verified {
    list: CommitmentList,
    result: VerificationResult,
}

/// Start an agent's actor and sidecar.
///
/// With `start_working` the agent enters `Working` and issues its assignment
/// prompt before this returns, so callers never observe it `Idle`.
pub fn launch(ctx: AgentContext, init: AgentInit, start_working: bool) -> AgentHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (sidecar_tx, sidecar_rx) = mpsc::unbounded_channel();
    let (verify_tx, verify_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(init.snapshot());
    let sidecar = SidecarHandle::spawn(ctx.sidecar.clone(), sidecar_tx);

    let span = info_span!("agent", name = %init.name, id = %init.id);
    let mut actor = AgentActor {
        spin: SpinDetector::new(ctx.settings.spin_threshold),
        budget: TokenBudget::restore(init.token_budget, init.tokens_used),
        ctx,
        id: init.id,
        name: init.name,
        kind: init.kind,
        parent: init.parent,
        children: init.children,
        assignment: init.assignment,
        lifecycle: init.lifecycle,
        commitments: init.commitments,
        done_behavior: init.done_behavior,
        continuation_token: init.continuation_token,
        queue: VecDeque::new(),
        in_flight: None,
        next_call_id: 0,
        pending_done: false,
        reap_requested: None,
        reap_reason: None,
        input_deadline: None,
        notices: VecDeque::new(),
        last_reply: None,
        retired: false,
        sidecar,
        verify_tx,
        snapshot_tx,
    };

    let handle = AgentHandle {
        inner: Arc::new(HandleInner {
            id: actor.id,
            name: actor.name.clone(),
            kind: actor.kind,
            parent: actor.parent,
            commands,
            snapshot: snapshot_rx,
        }),
    };

    span.in_scope(|| {
        if start_working {
            actor.begin_assignment();
        }
        actor.publish_snapshot();
    });
    tokio::spawn(actor.run(command_rx, sidecar_rx, verify_rx).instrument(span));
    handle
}

struct AgentActor {
    ctx: AgentContext,
    id: AgentId,
    name: String,
    kind: AgentKind,
    parent: Option<AgentId>,
    children: Vec<AgentId>,
    assignment: Option<String>,
    lifecycle: Lifecycle,
    commitments: CommitmentList,
    budget: TokenBudget,
    spin: SpinDetector,
    done_behavior: DoneBehavior,
    continuation_token: Option<String>,
    queue: VecDeque<Input>,
    in_flight: Option<InFlight>,
    next_call_id: u64,
    /// A completion signal arrived while input was queued (`CheckQueue`).
    pending_done: bool,
    /// Reap requested while verifying; applied when verification resolves.
    reap_requested: Option<ReapReason>,
    reap_reason: Option<ReapReason>,
    input_deadline: Option<Instant>,
    notices: VecDeque<Notice>,
    last_reply: Option<String>,
    retired: bool,
    sidecar: SidecarHandle,
    verify_tx: mpsc::UnboundedSender<Verified>,
    snapshot_tx: watch::Sender<AgentSnapshot>,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl AgentActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<AgentCommand>,
        mut sidecar_rx: mpsc::UnboundedReceiver<SidecarResult>,
        mut verify_rx: mpsc::UnboundedReceiver<Verified>,
    ) {
        while !self.retired {
            let deadline = self.input_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("all handles dropped; stopping");
                        break;
                    }
                },
                Some(result) = sidecar_rx.recv() => self.on_call_result(result),
                Some(verified) = verify_rx.recv() => self.on_verified(verified),
                () = wait_until(deadline) => self.on_input_timeout(),
            }
            self.publish_snapshot();
        }
        self.sidecar.shutdown();
        debug!("agent actor stopped");
    }

    fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Message(input) => self.on_input(input),
            AgentCommand::Bubble(envelope) => self.on_bubble(envelope),
            AgentCommand::Reap(reason) => self.reap(reason, None),
            AgentCommand::Dismiss(reply) => {
                let outcome = self.dismiss();
                let _ = reply.send(outcome);
            }
            AgentCommand::AddCommitment { commitment, reply } => {
                let _ = reply.send(self.add_commitment(commitment));
            }
            AgentCommand::AttachChild { child, reply } => {
                let accepted = !self.retired && !self.lifecycle.state().is_terminal();
                // A child that already left the tree is not recorded.
                if accepted && self.ctx.registry.get(child).is_some() {
                    self.children.push(child);
                    self.persist();
                }
                let _ = reply.send(accepted);
            }
            AgentCommand::DetachChild(child) => {
                self.children.retain(|id| *id != child);
                if !self.retired {
                    self.persist();
                }
            }
        }
    }

    // ---- lifecycle -------------------------------------------------------

    fn begin_assignment(&mut self) {
        if !self.transition(AgentState::Working, Some("assigned")) {
            return;
        }
        let assignment = self.assignment.clone().unwrap_or_default();
        let rendered = self.ctx.prompts.render_assignment(&AssignmentPrompt {
            name: &self.name,
            assignment: &assignment,
            commitments: &self.commitments,
            workdir: &self.ctx.settings.workdir,
            commitment_prefix: &self.ctx.settings.commitment_prefix,
        });
        let prompt = self.rendered_or(rendered, assignment);
        self.start_call(prompt);
    }

    fn on_input(&mut self, input: Input) {
        match self.lifecycle.state() {
            AgentState::Idle => {
                if self.transition(AgentState::Working, Some("input received")) {
                    self.prompt_with(input);
                }
            }
            AgentState::WaitingForInput => {
                self.input_deadline = None;
                if self.transition(AgentState::Working, Some("input received")) {
                    self.prompt_with(input);
                }
            }
            AgentState::Working if self.in_flight.is_none() => self.prompt_with(input),
            AgentState::Working | AgentState::Verifying => {
                debug!(queued = self.queue.len() + 1, "input queued");
                self.queue.push_back(input);
            }
            state @ (AgentState::Done | AgentState::FailedReaped) => {
                self.return_to_sender(input, &format!("agent is {state}"));
            }
        }
    }

    fn prompt_with(&mut self, input: Input) {
        let rendered = self
            .ctx
            .prompts
            .render_message(&input.origin_name, &input.text);
        let prompt = self.rendered_or(rendered, input.text);
        self.start_call(prompt);
    }

    /// Process the next queued input, if any.
    fn next_queued(&mut self) -> bool {
        match self.queue.pop_front() {
            Some(input) => {
                self.prompt_with(input);
                true
            }
            None => false,
        }
    }

    fn start_call(&mut self, prompt: String) {
        self.next_call_id += 1;
        let call_id = self.next_call_id;
        debug!(call_id, prompt_bytes = prompt.len(), "requesting messenger call");
        let cancel = self
            .sidecar
            .request(call_id, prompt.clone(), self.continuation_token.clone());
        self.in_flight = Some(InFlight {
            call_id,
            prompt,
            cancel,
        });
    }

    fn on_call_result(&mut self, result: SidecarResult) {
        let current = matches!(&self.in_flight, Some(call) if call.call_id == result.call_id);
        if !current || self.lifecycle.state() != AgentState::Working {
            debug!(call_id = result.call_id, "dropping stale call result");
            return;
        }
        let Some(call) = self.in_flight.take() else {
            return;
        };
        match result.outcome {
            Ok(reply) => {
                if let Some(token) = reply.continuation_token.clone() {
                    self.continuation_token = Some(token);
                }
                let tokens = reply
                    .tokens_used
                    .unwrap_or_else(|| estimate_tokens(&call.prompt, &reply.text));
                self.on_reply(reply.text, tokens);
            }
            Err(CallError::Cancelled) => debug!(call_id = call.call_id, "call cancelled"),
            Err(err) => {
                warn!(err = %err, "messenger call failed");
                self.reap(ReapReason::MessengerFailure, Some(err.to_string()));
            }
        }
    }

    fn on_reply(&mut self, text: String, tokens: u64) {
        self.last_reply = Some(text.clone());
        if let BudgetStatus::Exceeded { used, ceiling } = self.budget.charge(tokens) {
            info!(used, ceiling, "token budget exceeded");
            self.reap(
                ReapReason::TokenBudgetExceeded,
                Some(format!("used {used} of {ceiling} tokens")),
            );
            return;
        }
        if self.spin.observe(&text) {
            info!("identical responses repeated; agent is spinning");
            self.reap(ReapReason::SpinDetected, None);
            return;
        }
        self.absorb_declared(&text);

        let mut signal = self.ctx.classifier.classify(&text);
        if self.kind.is_immortal() && signal == Signal::Done {
            signal = Signal::None;
        }
        debug!(?signal, tokens, "reply classified");
        match signal {
            Signal::Waiting => self.await_input(&text),
            Signal::Done => {
                if self.done_behavior == DoneBehavior::CheckQueue && !self.queue.is_empty() {
                    self.pending_done = true;
                    self.next_queued();
                } else {
                    self.begin_verification();
                }
            }
            Signal::None => {
                let resumed = self.next_queued();
                if !resumed && self.pending_done {
                    self.begin_verification();
                } else if !resumed && self.should_auto_continue() {
                    let rendered = self.ctx.prompts.render_continue();
                    let prompt = self.rendered_or(rendered, "Continue.".to_string());
                    self.start_call(prompt);
                }
            }
        }
        self.persist();
    }

    fn should_auto_continue(&self) -> bool {
        self.ctx.settings.auto_continue && !self.kind.is_immortal() && self.assignment.is_some()
    }

    fn absorb_declared(&mut self, text: &str) {
        let declared = parse_declared(text, &self.ctx.settings.commitment_prefix);
        for line in &declared.rejected {
            warn!(line = %line, "ignoring malformed commitment declaration");
        }
        if declared.accepted.is_empty() {
            return;
        }
        info!(count = declared.accepted.len(), "agent declared commitments");
        for commitment in declared.accepted {
            self.commitments.push(commitment);
        }
        self.persist_commitments();
    }

    fn await_input(&mut self, text: &str) {
        if !self.transition(AgentState::WaitingForInput, Some("agent asked for input")) {
            return;
        }
        self.bubble_up(MessageKind::Question, text.to_string(), Destination::User);
        if let Some(input) = self.queue.pop_front() {
            if self.transition(AgentState::Working, Some("queued input")) {
                self.prompt_with(input);
            }
            return;
        }
        if !self.kind.is_immortal() {
            self.input_deadline = Some(Instant::now() + self.ctx.settings.input_timeout);
        }
    }

    fn on_input_timeout(&mut self) {
        self.input_deadline = None;
        if self.lifecycle.state() == AgentState::WaitingForInput {
            let secs = self.ctx.settings.input_timeout.as_secs();
            self.reap(
                ReapReason::InputTimeout,
                Some(format!("no input for {secs}s")),
            );
        }
    }

    fn begin_verification(&mut self) {
        if !self.transition(AgentState::Verifying, Some("completion signal")) {
            return;
        }
        self.pending_done = false;
        for commitment in self.commitments.items_mut().iter_mut() {
            commitment.record(CommitmentStatus::Verifying, None);
        }
        self.persist_commitments();

        let verifier = self.ctx.verifier.clone();
        let mut list = self.commitments.clone();
        let tx = self.verify_tx.clone();
        tokio::spawn(
            async move {
                let result = verifier.verify_all(&mut list).await;
                let _ = tx.send(Verified { list, result });
            }
            .in_current_span(),
        );
    }

    fn on_verified(&mut self, verified: Verified) {
        if self.lifecycle.state() != AgentState::Verifying {
            debug!("dropping stale verification result");
            return;
        }
        self.commitments = verified.list;
        self.persist_commitments();

        if verified.result.all_passed {
            if !self.transition(AgentState::Done, Some("all commitments passed")) {
                return;
            }
            let summary = format!(
                "{} completed; {} commitment(s) passed",
                self.name,
                self.commitments.len()
            );
            self.bubble_to_parent(MessageKind::Completed, summary);
            if self.reap_requested.take().is_some() {
                self.cleanup();
                return;
            }
            match self.done_behavior {
                DoneBehavior::WaitIdle => self.drain_queue("agent is done"),
                DoneBehavior::Terminate | DoneBehavior::CheckQueue => self.cleanup(),
            }
        } else {
            let failed: Vec<String> = self
                .commitments
                .failed()
                .map(|c| c.description().to_string())
                .collect();
            if !self.transition(AgentState::Working, Some("verification failed")) {
                return;
            }
            self.bubble_to_parent(
                MessageKind::VerificationFailed,
                format!("{} failed verification: {}", self.name, failed.join(", ")),
            );
            if let Some(reason) = self.reap_requested.take() {
                self.reap(reason, None);
                return;
            }
            let rendered = self.ctx.prompts.render_feedback(&self.commitments);
            let prompt = self.rendered_or(rendered, format!("Failed checks: {}", failed.join(", ")));
            self.start_call(prompt);
        }
    }

    fn dismiss(&mut self) -> Dismissal {
        if self.lifecycle.state() == AgentState::Verifying {
            info!("dismiss deferred until verification resolves");
            self.reap_requested.get_or_insert(ReapReason::ExternalReap);
            Dismissal::Deferred
        } else {
            self.reap(ReapReason::ExternalReap, None);
            Dismissal::Dismissed
        }
    }

    fn reap(&mut self, reason: ReapReason, detail: Option<String>) {
        if self.kind.is_immortal() {
            warn!(%reason, "refusing to reap the root agent");
            self.fault(format!("reap ({reason}) ignored: {} is immortal", self.name));
            return;
        }
        match self.lifecycle.state() {
            AgentState::Working | AgentState::WaitingForInput => {
                if let Some(call) = self.in_flight.take() {
                    call.cancel.cancel();
                }
                self.input_deadline = None;
                self.reap_reason = Some(reason);
                if self.transition(AgentState::FailedReaped, Some(reason.as_str())) {
                    let text = match detail {
                        Some(detail) => format!("{} reaped: {reason} ({detail})", self.name),
                        None => format!("{} reaped: {reason}", self.name),
                    };
                    self.bubble_to_parent(MessageKind::Reaped, text);
                }
                self.cleanup();
            }
            AgentState::Verifying => {
                info!(%reason, "reap deferred until verification resolves");
                self.reap_requested.get_or_insert(reason);
            }
            AgentState::Idle => {
                self.reap_reason = Some(reason);
                self.cleanup();
            }
            AgentState::Done => self.cleanup(),
            AgentState::FailedReaped => {}
        }
    }

    fn add_commitment(&mut self, commitment: Commitment) -> Result<(), ToolError> {
        match self.lifecycle.state() {
            state if state.is_terminal() => Err(ToolError::AgentTerminal { id: self.id, state }),
            AgentState::Verifying => Err(ToolError::Verifying(self.id)),
            _ => {
                self.commitments.push(commitment);
                self.persist_commitments();
                Ok(())
            }
        }
    }

    /// Leave the tree: reap children, detach from the parent, return queued
    /// input, drop out of the registry, and mark the document retired.
    fn cleanup(&mut self) {
        if self.retired {
            return;
        }
        for child in &self.children {
            if let Some(handle) = self.ctx.registry.get(*child) {
                handle.reap(ReapReason::ParentReaped);
            }
        }
        if let Some(parent) = self.parent.and_then(|id| self.ctx.registry.get(id)) {
            parent.detach_child(self.id);
        }
        self.drain_queue("agent left the tree");
        self.ctx.registry.remove(self.id);
        self.retired = true;
        self.input_deadline = None;
        self.sidecar.shutdown();
        self.persist();
        self.ctx.events.publish(Notification::Retired {
            agent_id: self.id,
            agent_name: self.name.clone(),
            timestamp: Utc::now(),
        });
        info!(state = %self.lifecycle.state(), "agent retired");
    }

    // ---- bubbling --------------------------------------------------------

    fn on_bubble(&mut self, envelope: Envelope) {
        self.notices.push_back(Notice {
            from: envelope.origin,
            from_name: envelope.origin_name.clone(),
            message: envelope.message.clone(),
        });
        while self.notices.len() > MAX_NOTICES {
            self.notices.pop_front();
        }

        let addressed_here = envelope.destination == Destination::Agent(self.id);
        if self.kind.is_immortal() {
            // Last hop before the outside collaborator.
            self.ctx.events.publish(Notification::Bubbled {
                agent_id: envelope.origin,
                agent_name: envelope.origin_name.clone(),
                destination: envelope.destination,
                message: envelope.message.clone(),
                timestamp: Utc::now(),
            });
            if !addressed_here && envelope.destination != Destination::User {
                self.undeliverable(envelope, "destination is not an ancestor of the sender");
            }
            return;
        }
        if addressed_here {
            debug!(from = %envelope.origin_name, kind = ?envelope.message.kind, "bubbled message consumed");
            return;
        }
        self.forward(envelope);
    }

    fn forward(&self, mut envelope: Envelope) {
        envelope.message.hops += 1;
        let parent = self.parent.and_then(|id| self.ctx.registry.get(id));
        match parent {
            Some(parent) => {
                if parent.bubble(envelope.clone()).is_err() {
                    self.undeliverable(envelope, "parent exited");
                }
            }
            None => self.undeliverable(envelope, "parent is gone"),
        }
    }

    /// Start a message from this agent toward `destination`.
    fn bubble_up(&self, kind: MessageKind, text: String, destination: Destination) {
        let envelope = Envelope {
            origin: self.id,
            origin_name: self.name.clone(),
            destination,
            message: BubbledMessage::new(kind, text),
        };
        if self.kind.is_immortal() {
            self.ctx.events.publish(Notification::Bubbled {
                agent_id: self.id,
                agent_name: self.name.clone(),
                destination,
                message: envelope.message,
                timestamp: Utc::now(),
            });
            return;
        }
        let parent = self.parent.and_then(|id| self.ctx.registry.get(id));
        match parent {
            Some(parent) => {
                if parent.bubble(envelope.clone()).is_err() {
                    self.undeliverable(envelope, "parent exited");
                }
            }
            None => self.undeliverable(envelope, "parent is gone"),
        }
    }

    fn bubble_to_parent(&self, kind: MessageKind, text: String) {
        let destination = match self.parent {
            Some(parent) => Destination::Agent(parent),
            None => Destination::User,
        };
        self.bubble_up(kind, text, destination);
    }

    /// Tell the sender of `envelope` it could not be delivered.
    fn undeliverable(&self, envelope: Envelope, reason: &str) {
        warn!(from = %envelope.origin_name, reason, "bubbled message undeliverable");
        let message = BubbledMessage::new(
            MessageKind::DeliveryFailure,
            format!(
                "{:?} from {} was not delivered ({reason}): {}",
                envelope.message.kind, envelope.origin_name, envelope.message.text
            ),
        );
        let destination = Destination::Agent(envelope.origin);
        self.ctx.events.publish(Notification::Bubbled {
            agent_id: self.id,
            agent_name: self.name.clone(),
            destination,
            message: message.clone(),
            timestamp: Utc::now(),
        });
        if envelope.message.kind == MessageKind::DeliveryFailure || envelope.origin == self.id {
            return;
        }
        if let Some(origin) = self.ctx.registry.get(envelope.origin) {
            let _ = origin.bubble(Envelope {
                origin: self.id,
                origin_name: self.name.clone(),
                destination,
                message,
            });
        }
    }

    fn return_to_sender(&self, input: Input, reason: &str) {
        let message = BubbledMessage::new(
            MessageKind::DeliveryFailure,
            format!(
                "message to {} was not delivered ({reason}): {}",
                self.name, input.text
            ),
        );
        let destination = input.origin.destination();
        self.ctx.events.publish(Notification::Bubbled {
            agent_id: self.id,
            agent_name: self.name.clone(),
            destination,
            message: message.clone(),
            timestamp: Utc::now(),
        });
        if let Origin::Agent(sender) = input.origin {
            if let Some(handle) = self.ctx.registry.get(sender) {
                let _ = handle.bubble(Envelope {
                    origin: self.id,
                    origin_name: self.name.clone(),
                    destination,
                    message,
                });
            }
        }
    }

    fn drain_queue(&mut self, reason: &str) {
        while let Some(input) = self.queue.pop_front() {
            self.return_to_sender(input, reason);
        }
    }

    // ---- bookkeeping -----------------------------------------------------

    fn transition(&mut self, to: AgentState, reason: Option<&str>) -> bool {
        let from = self.lifecycle.state();
        let applied = self
            .lifecycle
            .transition(to, reason.map(str::to_string), Utc::now())
            .map(|record| record.at);
        match applied {
            Ok(timestamp) => {
                info!(%from, %to, reason, "state changed");
                self.ctx.events.publish(Notification::StateChanged {
                    agent_id: self.id,
                    agent_name: self.name.clone(),
                    old_state: from,
                    new_state: to,
                    timestamp,
                    reason: reason.map(str::to_string),
                });
                self.persist();
                true
            }
            Err(err) => {
                error!(err = %err, "transition rejected");
                self.fault(err.to_string());
                false
            }
        }
    }

    fn rendered_or(&self, rendered: anyhow::Result<String>, fallback: String) -> String {
        match rendered {
            Ok(prompt) => prompt,
            Err(err) => {
                error!(err = %format!("{err:#}"), "prompt rendering failed; sending raw text");
                self.fault(format!("prompt rendering failed: {err:#}"));
                fallback
            }
        }
    }

    /// Surface an internal error on the notification stream.
    fn fault(&self, text: String) {
        self.ctx.events.publish(Notification::Bubbled {
            agent_id: self.id,
            agent_name: self.name.clone(),
            destination: Destination::User,
            message: BubbledMessage::new(MessageKind::Fault, text),
            timestamp: Utc::now(),
        });
    }

    fn record(&self) -> AgentRecord {
        AgentRecord {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.lifecycle.state(),
            assignment: self.assignment.clone(),
            parent: self.parent,
            children: self.children.clone(),
            continuation_token: self.continuation_token.clone(),
            token_budget: self.budget.ceiling(),
            tokens_used: self.budget.used(),
            done_behavior: self.done_behavior,
            retired: self.retired,
            reap_reason: self.reap_reason,
            transitions: self.lifecycle.history().to_vec(),
        }
    }

    fn persist(&self) {
        if let Err(err) = write_agent(self.ctx.store.as_ref(), &self.record()) {
            error!(err = %err, "failed to persist agent document");
            self.fault(format!("failed to persist agent document: {err}"));
        }
    }

    fn persist_commitments(&self) {
        if let Err(err) = write_commitments(self.ctx.store.as_ref(), self.id, &self.commitments) {
            error!(err = %err, "failed to persist commitments");
            self.fault(format!("failed to persist commitments: {err}"));
        }
    }

    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            state: self.lifecycle.state(),
            parent: self.parent,
            children: self.children.clone(),
            assignment: self.assignment.clone(),
            tokens_used: self.budget.used(),
            token_budget: self.budget.ceiling(),
            commitments: self.commitments.clone(),
            queued: self.queue.len(),
            call_in_flight: self.in_flight.is_some(),
            reap_reason: self.reap_reason,
            notices: self.notices.iter().cloned().collect(),
            last_reply: self.last_reply.clone(),
            retired: self.retired,
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::{Initiator, SpawnConfig};
    use crate::test_support::{ScriptStep, ScriptedChecks, ScriptedMessenger, harness, test_config};

    #[tokio::test]
    async fn commands_to_an_exited_actor_report_agent_gone() {
        let (handle, rx) = AgentHandle::detached("ada", AgentKind::Mortal);
        drop(rx);
        let err = handle.send(Origin::User, "user", "hello").expect_err("gone");
        assert!(matches!(err, ToolError::AgentGone(id) if id == handle.id()));
        assert!(!handle.reap(ReapReason::ExternalReap));
        assert!(!handle.attach_child(AgentId::new()).await);
    }

    #[tokio::test]
    async fn root_cannot_be_dismissed() {
        let (handle, _rx) = AgentHandle::detached("hive", AgentKind::Root);
        assert!(matches!(handle.dismiss().await, Err(ToolError::RootImmortal)));
    }

    #[tokio::test]
    async fn wait_for_fails_once_the_actor_is_gone() {
        let (handle, _rx) = AgentHandle::detached("ada", AgentKind::Mortal);
        let err = handle
            .wait_for(|snapshot| snapshot.state == AgentState::Done)
            .await
            .expect_err("no actor");
        assert!(matches!(err, ToolError::AgentGone(_)));
    }

    #[tokio::test]
    async fn completion_stops_at_the_addressed_parent() {
        let messenger = ScriptedMessenger::new()
            .script("lead the migration", vec![ScriptStep::text("delegating")])
            .script("port the schema", vec![ScriptStep::text("DONE")]);
        let h = harness(test_config(), Arc::new(messenger), Arc::new(ScriptedChecks::new())).await;
        let root = h.orchestrator.root().clone();
        let spawner = h.orchestrator.spawner();
        let lead = spawner
            .spawn(Initiator::Parent(root.id()), SpawnConfig::assigned("lead the migration"))
            .await
            .expect("lead");
        let helper = spawner
            .spawn(Initiator::Parent(lead.id()), SpawnConfig::assigned("port the schema"))
            .await
            .expect("helper");

        let lead_view = lead
            .wait_for(|s| s.notices.iter().any(|n| n.from == helper.id()))
            .await
            .expect("lead notified");
        assert_eq!(lead_view.notices[0].message.kind, MessageKind::Completed);
        assert_eq!(lead_view.notices[0].message.hops, 0);
        lead.wait_for(|s| s.children.is_empty()).await.expect("helper detached");
        assert!(root.snapshot().notices.iter().all(|n| n.from != helper.id()));
    }

    #[tokio::test]
    async fn misaddressed_bubble_returns_to_sender() {
        let messenger = ScriptedMessenger::new().reply_with("working");
        let h = harness(test_config(), Arc::new(messenger), Arc::new(ScriptedChecks::new())).await;
        let root = h.orchestrator.root().clone();
        let ada = h
            .orchestrator
            .spawner()
            .spawn(Initiator::Parent(root.id()), SpawnConfig::assigned("audit"))
            .await
            .expect("spawn");

        ada.bubble(Envelope {
            origin: ada.id(),
            origin_name: "ada".into(),
            destination: Destination::Agent(AgentId::new()),
            message: BubbledMessage::new(MessageKind::Question, "anyone there?"),
        })
        .expect("bubble");

        let ada_view = ada
            .wait_for(|s| {
                s.notices
                    .iter()
                    .any(|n| n.message.kind == MessageKind::DeliveryFailure)
            })
            .await
            .expect("failure returned");
        let failure = ada_view
            .notices
            .iter()
            .find(|n| n.message.kind == MessageKind::DeliveryFailure)
            .expect("failure notice");
        assert_eq!(failure.from, root.id());
        assert!(failure.message.text.contains("anyone there?"));

        let root_view = root
            .wait_for(|s| !s.notices.is_empty())
            .await
            .expect("root notices");
        let forwarded = root_view
            .notices
            .iter()
            .find(|n| n.message.kind == MessageKind::Question)
            .expect("root saw the question");
        assert_eq!(forwarded.message.hops, 1);
    }

    #[test]
    fn initial_record_reflects_init() {
        let init = AgentInit {
            id: AgentId::new(),
            name: "ada".into(),
            kind: AgentKind::Mortal,
            parent: Some(AgentId::new()),
            children: Vec::new(),
            assignment: Some("build X".into()),
            commitments: CommitmentList::default(),
            token_budget: Some(100),
            tokens_used: 0,
            done_behavior: DoneBehavior::WaitIdle,
            continuation_token: None,
            lifecycle: Lifecycle::new(),
        };
        let record = init.record();
        assert_eq!(record.state, AgentState::Idle);
        assert_eq!(record.assignment.as_deref(), Some("build X"));
        assert!(!record.retired);
    }
}
