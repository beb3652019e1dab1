//! Trace data model and the per-trace state machine.
//!
//! [`TraceStore`] is the authoritative in-memory model of "the current task":
//! the trace identity, the steps collected so far, aggregate metadata, and
//! the terminal outcome. It is mutated only by applying protocol events (one
//! writer, the viewer's apply loop) or by an explicit [`TraceStore::reset`].
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──agent_start──▶ AwaitingSandbox ──first agent_progress──▶ Running
//!                              │               or vnc_url_set        │
//!                              └────────────────────────────────────┐│
//!                                                                   ▼▼
//!                                     agent_complete / agent_error ▶ Terminal
//! ```
//!
//! `Terminal` is entered exactly once per trace and is irreversible; a later
//! `agent_start` begins a brand-new trace (explicit reset + reseed, never a
//! merge).
//!
//! ## Idempotency
//!
//! The transport delivers at-least-once with per-trace ordering, so the same
//! `stepId` may arrive more than once. [`TraceStore::apply_step`] dedupes by
//! `stepId`: a duplicate is a no-op and does not grow the step list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// User feedback on a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEvaluation {
    Like,
    Dislike,
    #[default]
    Neutral,
}

/// User feedback on a whole trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserEvaluation {
    Success,
    Failed,
    #[default]
    NotEvaluated,
}

/// Terminal state reported by the backend in `agent_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalState {
    Success,
    Stopped,
    MaxStepsReached,
    Error,
    SandboxTimeout,
}

/// One parsed agent action (click, type, scroll, ...) within a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    pub function_name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub description: String,
}

/// One agent perception/decision/action cycle within a trace.
///
/// `step_id` is the idempotency key; `image` is an opaque base64 payload the
/// core never inspects (the export bundle decodes it, nothing else does).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "stepId")]
    pub step_id: String,
    pub image: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(rename = "inputTokensUsed", default)]
    pub input_tokens: u64,
    #[serde(rename = "outputTokensUsed", default)]
    pub output_tokens: u64,
    #[serde(rename = "step_evaluation", default)]
    pub evaluation: StepEvaluation,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub thought: Option<String>,
    #[serde(default)]
    pub actions: Vec<AgentAction>,
}

/// Aggregate counters for a trace. Counters are monotonically non-decreasing
/// except `max_steps`, which the backend may report as 0 before the agent is
/// configured — see [`TraceMetadata::merge_from`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(rename = "traceId", default)]
    pub trace_id: String,
    #[serde(rename = "inputTokensUsed", default)]
    pub input_tokens: u64,
    #[serde(rename = "outputTokensUsed", default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub duration: f64,
    #[serde(rename = "numberOfSteps", default)]
    pub step_count: u32,
    #[serde(rename = "maxSteps", default)]
    pub max_steps: u32,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub final_state: Option<FinalState>,
    #[serde(default)]
    pub user_evaluation: UserEvaluation,
}

impl TraceMetadata {
    /// Replace this metadata with `newer`, keeping the last known good
    /// `max_steps`: the backend sends 0 until the agent is configured, and a
    /// previously known positive value must never regress.
    pub fn merge_from(&mut self, newer: TraceMetadata) {
        let known_max = self.max_steps;
        *self = newer;
        if self.max_steps == 0 {
            self.max_steps = known_max;
        }
    }
}

/// One end-to-end execution of an agent task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTrace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub instruction: String,
    #[serde(rename = "modelId")]
    pub model_id: String,
    #[serde(rename = "isRunning")]
    pub is_running: bool,
    #[serde(default)]
    pub steps: Vec<AgentStep>,
    #[serde(rename = "traceMetadata", default)]
    pub metadata: TraceMetadata,
}

impl AgentTrace {
    /// Build a fresh trace for dispatch. The id must come from a heartbeat —
    /// the backend assigns it before any task starts.
    pub fn new(trace_id: String, instruction: String, model_id: String) -> Self {
        let metadata = TraceMetadata {
            trace_id: trace_id.clone(),
            ..TraceMetadata::default()
        };
        Self {
            id: trace_id,
            timestamp: Utc::now(),
            instruction,
            model_id,
            is_running: false,
            steps: Vec::new(),
            metadata,
        }
    }
}

/// How a trace ended. Created exactly once per trace and immutable afterwards
/// except for `user_evaluation` propagation into the metadata snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Stopped,
    MaxStepsReached,
    SandboxTimeout,
}

/// Terminal classification of a trace plus the metadata snapshot at
/// completion time.
#[derive(Debug, Clone)]
pub struct FinalOutcome {
    pub outcome: Outcome,
    pub message: String,
    pub metadata: TraceMetadata,
}

impl FinalOutcome {
    /// Derive the outcome from the available terminal signals.
    ///
    /// An explicit `final_state` from `agent_complete` takes precedence over a
    /// locally recorded error (a step-level `error` field). Absent both, or a
    /// successful `final_state`, the outcome is success.
    fn derive(
        final_state: Option<FinalState>,
        local_error: Option<&str>,
        metadata: TraceMetadata,
    ) -> Self {
        let (outcome, message) = match final_state {
            Some(FinalState::Success) => (Outcome::Success, "Task completed successfully".into()),
            Some(FinalState::Stopped) => (Outcome::Stopped, "Task stopped by user".into()),
            Some(FinalState::MaxStepsReached) => (
                Outcome::MaxStepsReached,
                "Maximum number of steps reached".into(),
            ),
            Some(FinalState::SandboxTimeout) => {
                (Outcome::SandboxTimeout, "Sandbox timed out".into())
            }
            Some(FinalState::Error) => (
                Outcome::Failure,
                local_error.unwrap_or("Agent run failed").to_string(),
            ),
            None => match local_error {
                Some(err) => (Outcome::Failure, err.to_string()),
                None => (Outcome::Success, "Task completed successfully".into()),
            },
        };
        Self {
            outcome,
            message,
            metadata,
        }
    }
}

/// Where the current trace is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracePhase {
    /// No trace yet, or state after [`TraceStore::reset`].
    #[default]
    Idle,
    /// `agent_start` received, remote sandbox not yet confirmed live.
    AwaitingSandbox,
    /// Steps are streaming.
    Running,
    /// `agent_complete` or `agent_error` observed. Irreversible.
    Terminal,
}

/// Outcome of `agent_start`: whether the backend actually scheduled the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartStatus {
    #[default]
    Success,
    MaxSandboxesReached,
}

/// Read-only copy of the store, cloned whole so readers never observe a
/// half-updated trace.
#[derive(Debug, Clone)]
pub struct TraceSnapshot {
    pub phase: TracePhase,
    pub trace: Option<AgentTrace>,
    pub outcome: Option<FinalOutcome>,
    pub pending_trace_id: Option<String>,
    pub vnc_url: Option<String>,
    pub models: Vec<String>,
    pub dark_mode: bool,
    pub start_status: StartStatus,
}

impl TraceSnapshot {
    /// Steps of the current trace, empty when there is none.
    pub fn steps(&self) -> &[AgentStep] {
        self.trace.as_ref().map(|t| t.steps.as_slice()).unwrap_or(&[])
    }
}

/// The single mutable trace aggregate.
///
/// Cross-trace process state (pending trace id, dark-mode preference, model
/// catalog) lives here too so it survives [`TraceStore::reset`] between
/// tasks on the same connection.
#[derive(Debug, Default)]
pub struct TraceStore {
    // Cross-trace state: survives reset().
    pending_trace_id: Option<String>,
    dark_mode: bool,
    models: Vec<String>,

    // Per-trace state: discarded on reset().
    phase: TracePhase,
    trace: Option<AgentTrace>,
    vnc_url: Option<String>,
    local_error: Option<String>,
    outcome: Option<FinalOutcome>,
    start_status: StartStatus,
}

impl TraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> TracePhase {
        self.phase
    }

    pub fn trace(&self) -> Option<&AgentTrace> {
        self.trace.as_ref()
    }

    pub fn outcome(&self) -> Option<&FinalOutcome> {
        self.outcome.as_ref()
    }

    pub fn pending_trace_id(&self) -> Option<&str> {
        self.pending_trace_id.as_deref()
    }

    pub fn vnc_url(&self) -> Option<&str> {
        self.vnc_url.as_deref()
    }

    pub fn dark_mode(&self) -> bool {
        self.dark_mode
    }

    pub fn set_dark_mode(&mut self, on: bool) {
        self.dark_mode = on;
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn set_models(&mut self, models: Vec<String>) {
        self.models = models;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, TracePhase::AwaitingSandbox | TracePhase::Running)
    }

    /// Whole-value copy for readers.
    pub fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            phase: self.phase,
            trace: self.trace.clone(),
            outcome: self.outcome.clone(),
            pending_trace_id: self.pending_trace_id.clone(),
            vnc_url: self.vnc_url.clone(),
            models: self.models.clone(),
            dark_mode: self.dark_mode,
            start_status: self.start_status,
        }
    }

    /// `heartbeat` — assign or refresh the pending trace id. This is the only
    /// source of trace identity prior to task dispatch.
    pub fn set_heartbeat(&mut self, uuid: String) {
        self.pending_trace_id = Some(uuid);
    }

    /// The transport dropped: the heartbeat-assigned id is no longer valid and
    /// the live view is gone. The collected trace stays inspectable.
    pub fn on_connection_lost(&mut self) {
        self.pending_trace_id = None;
        self.vnc_url = None;
    }

    /// `agent_start` — discard any previous trace and seed from the
    /// server-sent one. The new trace is running and waiting on its sandbox.
    pub fn start(&mut self, mut trace: AgentTrace, status: StartStatus) {
        self.reset();
        trace.is_running = true;
        if trace.metadata.trace_id.is_empty() {
            trace.metadata.trace_id = trace.id.clone();
        }
        self.trace = Some(trace);
        self.phase = TracePhase::AwaitingSandbox;
        self.start_status = status;
    }

    /// `agent_progress` — idempotently append a step and replace the
    /// aggregate metadata. Returns `false` when the step id was already
    /// present (duplicate delivery).
    pub fn apply_step(&mut self, step: AgentStep, metadata: TraceMetadata) -> bool {
        let trace = match self.trace.as_mut() {
            Some(t) => t,
            None => {
                // Ordering guarantee violated (progress before start) — drop.
                return false;
            }
        };

        // The first progress event confirms the sandbox is live.
        if self.phase == TracePhase::AwaitingSandbox {
            self.phase = TracePhase::Running;
        }

        if trace.steps.iter().any(|s| s.step_id == step.step_id) {
            return false;
        }

        if let Some(err) = &step.error {
            self.local_error = Some(err.clone());
        }
        trace.steps.push(step);
        trace.metadata.merge_from(metadata);
        true
    }

    /// `vnc_url_set` — the live view is up, which also confirms the sandbox.
    pub fn set_vnc_url(&mut self, url: String) {
        self.vnc_url = Some(url);
        if self.phase == TracePhase::AwaitingSandbox {
            self.phase = TracePhase::Running;
        }
    }

    /// `vnc_url_unset` — live view torn down.
    pub fn clear_vnc_url(&mut self) {
        self.vnc_url = None;
    }

    /// `agent_complete` — terminal, exactly once. An explicit `final_state`
    /// takes precedence over any locally recorded step error.
    pub fn complete(&mut self, metadata: TraceMetadata, final_state: FinalState) {
        if self.outcome.is_some() {
            return;
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.is_running = false;
            trace.metadata.merge_from(metadata);
            trace.metadata.completed = true;
            trace.metadata.final_state = Some(final_state);
        }
        let snapshot = self
            .trace
            .as_ref()
            .map(|t| t.metadata.clone())
            .unwrap_or_default();
        self.outcome = Some(FinalOutcome::derive(
            Some(final_state),
            self.local_error.as_deref(),
            snapshot,
        ));
        self.phase = TracePhase::Terminal;
    }

    /// `agent_error` — terminal failure, unless a more specific terminal
    /// state already exists.
    pub fn fail(&mut self, error: String) {
        self.local_error = Some(error.clone());
        if self.outcome.is_some() {
            return;
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.is_running = false;
        }
        let snapshot = self
            .trace
            .as_ref()
            .map(|t| t.metadata.clone())
            .unwrap_or_default();
        self.outcome = Some(FinalOutcome::derive(None, Some(&error), snapshot));
        self.phase = TracePhase::Terminal;
    }

    /// Update one step's evaluation in place. Returns `false` if the step id
    /// is unknown.
    pub fn apply_step_evaluation(&mut self, step_id: &str, evaluation: StepEvaluation) -> bool {
        match self
            .trace
            .as_mut()
            .and_then(|t| t.steps.iter_mut().find(|s| s.step_id == step_id))
        {
            Some(step) => {
                step.evaluation = evaluation;
                true
            }
            None => false,
        }
    }

    /// Update the whole-trace user evaluation, propagating into the outcome's
    /// metadata snapshot.
    pub fn apply_trace_evaluation(&mut self, evaluation: UserEvaluation) {
        if let Some(trace) = self.trace.as_mut() {
            trace.metadata.user_evaluation = evaluation;
        }
        if let Some(outcome) = self.outcome.as_mut() {
            outcome.metadata.user_evaluation = evaluation;
        }
    }

    /// Discard trace-specific state, preserving cross-trace process state
    /// (pending trace id, dark-mode preference, model catalog).
    pub fn reset(&mut self) {
        self.phase = TracePhase::Idle;
        self.trace = None;
        self.vnc_url = None;
        self.local_error = None;
        self.outcome = None;
        self.start_status = StartStatus::Success;
    }
}
