//! The viewer core: one connection, one trace store, many readers.
//!
//! [`Viewer`] wires the pieces together: the [`ConnectionManager`] delivers
//! raw frames, the protocol module decodes them, and a single apply task
//! mutates the [`TraceStore`] — the only writer, so readers never observe a
//! half-updated trace. Readers take whole-value snapshots and follow an
//! epoch counter on a `watch` channel ([`Viewer::subscribe`]): every change
//! bumps the epoch, and a receiver that has not yet observed the latest
//! epoch wakes immediately. A change published while the reader is busy
//! rendering is therefore never lost — essential because `agent_complete`
//! can be the last event a trace ever produces.
//!
//! Outbound commands flow the other way: `dispatch_task` / `stop_task`
//! encode protocol messages and hand them to the connection. Dispatching
//! requires a heartbeat-assigned trace id; without one the client is
//! desynced from the backend and the session is unrecoverable — callers get
//! [`DispatchError::NoTraceId`] and should tear down rather than send a
//! malformed request.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use crate::client::{ClientError, CoreClient};
use crate::config::ViewerConfig;
use crate::connection::{ConnEvent, ConnectionManager, ConnectionState};
use crate::protocol::{self, ServerEvent};
use crate::trace::{
    AgentTrace, StepEvaluation, TraceSnapshot, TraceStore, UserEvaluation,
};

/// Why an outbound command could not be sent.
#[derive(Debug)]
pub enum DispatchError {
    /// No heartbeat-assigned trace id: the client is desynced from the
    /// backend. Unrecoverable for this session — reconnect from scratch.
    NoTraceId,
    /// `stop_task` with no running trace.
    NoRunningTask,
    /// The connection task is gone.
    Transport(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::NoTraceId => {
                write!(f, "no trace id from heartbeat — client is desynced")
            }
            DispatchError::NoRunningTask => write!(f, "no running task to stop"),
            DispatchError::Transport(msg) => write!(f, "transport: {}", msg),
        }
    }
}

/// User-facing notification (throttled transport errors, exhausted retries).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    TransportError(String),
    RetriesExhausted,
}

/// Top-level handle over the streaming core. Cheap to share behind an `Arc`.
pub struct Viewer {
    conn: ConnectionManager,
    rest: CoreClient,
    store: Arc<Mutex<TraceStore>>,
    notices: Arc<Mutex<Vec<Notice>>>,
    changes: Arc<watch::Sender<u64>>,
}

/// Publish a change by bumping the epoch. Receivers that have not observed
/// the new value wake on their next (or current) `changed()` call.
fn bump(changes: &watch::Sender<u64>) {
    changes.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
}

impl Viewer {
    /// Connect to the backend and spawn the apply task.
    pub fn connect(config: &ViewerConfig) -> Result<Self, String> {
        let ws_url = config.ws_url()?;
        let (event_tx, event_rx) = mpsc::channel::<ConnEvent>(256);

        let conn = ConnectionManager::connect(ws_url, event_tx);
        let store = Arc::new(Mutex::new(TraceStore::new()));
        let notices = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(watch::channel(0u64).0);

        tokio::spawn(apply_loop(
            event_rx,
            Arc::clone(&store),
            Arc::clone(&notices),
            Arc::clone(&changes),
        ));

        Ok(Self {
            conn,
            rest: CoreClient::new(&config.base_url),
            store,
            notices,
            changes,
        })
    }

    /// Current transport state.
    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Watch transport state transitions.
    pub fn connection_watch(&self) -> watch::Receiver<ConnectionState> {
        self.conn.state_watch()
    }

    /// Subscribe to change notifications (trace, connection, or notices).
    ///
    /// Take the receiver before reading the first snapshot, then alternate
    /// `snapshot()` and `changed().await`: a change published while the
    /// caller is between the two resolves the pending `changed()` right
    /// away instead of being dropped.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Whole-value copy of the current trace state.
    pub async fn snapshot(&self) -> TraceSnapshot {
        self.store.lock().await.snapshot()
    }

    /// Drain queued user-facing notifications.
    pub async fn take_notices(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().await)
    }

    /// Fetch the model catalog and store it (survives trace resets).
    pub async fn load_models(&self) -> Result<Vec<String>, ClientError> {
        let models = self.rest.models().await?;
        self.store.lock().await.set_models(models.clone());
        bump(&self.changes);
        Ok(models)
    }

    /// A random task instruction from the backend's pool.
    pub async fn random_instruction(&self) -> Result<String, ClientError> {
        self.rest.generate_instruction().await
    }

    pub async fn set_dark_mode(&self, on: bool) {
        self.store.lock().await.set_dark_mode(on);
        bump(&self.changes);
    }

    /// Dispatch a new task. The trace id must have arrived on a heartbeat
    /// over the live connection; the server echoes the trace back in
    /// `agent_start`, which is what actually seeds the local state.
    pub async fn dispatch_task(
        &self,
        instruction: &str,
        model_id: &str,
    ) -> Result<String, DispatchError> {
        let trace_id = self
            .store
            .lock()
            .await
            .pending_trace_id()
            .map(str::to_string)
            .ok_or(DispatchError::NoTraceId)?;

        let trace = AgentTrace::new(trace_id.clone(), instruction.into(), model_id.into());
        self.conn
            .send(protocol::encode_user_task(&trace))
            .await
            .map_err(DispatchError::Transport)?;
        Ok(trace_id)
    }

    /// Request cancellation of the running task. This changes no local
    /// state; the authoritative `stopped` outcome arrives later as an
    /// `agent_complete`.
    pub async fn stop_task(&self) -> Result<(), DispatchError> {
        let trace_id = {
            let store = self.store.lock().await;
            match store.trace() {
                Some(trace) if store.is_running() => trace.id.clone(),
                _ => return Err(DispatchError::NoRunningTask),
            }
        };
        self.conn
            .send(protocol::encode_stop_task(&trace_id))
            .await
            .map_err(DispatchError::Transport)
    }

    /// Record step feedback: REST first, then the optimistic local update.
    /// On failure nothing is rolled back — the error is surfaced as-is.
    pub async fn rate_step(
        &self,
        step_id: &str,
        evaluation: StepEvaluation,
    ) -> Result<(), ClientError> {
        let trace_id = self
            .store
            .lock()
            .await
            .trace()
            .map(|t| t.id.clone())
            .ok_or_else(|| ClientError::Protocol("no trace to evaluate".into()))?;

        self.rest
            .update_step_evaluation(&trace_id, step_id, evaluation)
            .await?;
        self.store
            .lock()
            .await
            .apply_step_evaluation(step_id, evaluation);
        bump(&self.changes);
        Ok(())
    }

    /// Record whole-trace feedback, same policy as [`Viewer::rate_step`].
    pub async fn rate_trace(&self, evaluation: UserEvaluation) -> Result<(), ClientError> {
        let trace_id = self
            .store
            .lock()
            .await
            .trace()
            .map(|t| t.id.clone())
            .ok_or_else(|| ClientError::Protocol("no trace to evaluate".into()))?;

        self.rest
            .update_trace_evaluation(&trace_id, evaluation)
            .await?;
        self.store.lock().await.apply_trace_evaluation(evaluation);
        bump(&self.changes);
        Ok(())
    }

    /// Force-close and reconnect, resetting the retry budget.
    pub async fn manual_reconnect(&self) {
        self.conn.manual_reconnect().await;
    }

    /// Close normally; no automatic reconnect follows.
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }
}

/// Single-writer apply task: connection events in, store mutations out.
async fn apply_loop(
    mut events: mpsc::Receiver<ConnEvent>,
    store: Arc<Mutex<TraceStore>>,
    notices: Arc<Mutex<Vec<Notice>>>,
    changes: Arc<watch::Sender<u64>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnEvent::Message(text) => match protocol::decode_event(&text) {
                Ok(Some(server_event)) => {
                    apply_server_event(&mut *store.lock().await, server_event);
                }
                Ok(None) => debug!("ignoring unknown message type"),
                Err(e) => warn!(error = %e, "dropping undecodable message"),
            },
            ConnEvent::StateChanged(state) => {
                if matches!(
                    state,
                    ConnectionState::Disconnected | ConnectionState::Error
                ) {
                    store.lock().await.on_connection_lost();
                }
            }
            ConnEvent::SurfacedError(message) => {
                notices.lock().await.push(Notice::TransportError(message));
            }
            ConnEvent::RetriesExhausted => {
                notices.lock().await.push(Notice::RetriesExhausted);
            }
        }
        bump(&changes);
    }
}

/// Map one decoded protocol event onto the trace state machine.
fn apply_server_event(store: &mut TraceStore, event: ServerEvent) {
    match event {
        ServerEvent::Heartbeat { uuid } => store.set_heartbeat(uuid),
        ServerEvent::AgentStart { trace, status } => store.start(trace, status),
        ServerEvent::AgentProgress { step, metadata } => {
            store.apply_step(step, metadata);
        }
        ServerEvent::AgentComplete {
            metadata,
            final_state,
        } => store.complete(metadata, final_state),
        ServerEvent::AgentError { error } => store.fail(error),
        ServerEvent::VncUrlSet { url } => store.set_vnc_url(url),
        ServerEvent::VncUrlUnset => store.clear_vnc_url(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{Outcome, TracePhase};

    fn apply_text(store: &mut TraceStore, text: &str) {
        let event = protocol::decode_event(text)
            .expect("decode")
            .expect("known event");
        apply_server_event(store, event);
    }

    fn progress(step_id: &str) -> String {
        format!(
            r#"{{
                "type": "agent_progress",
                "agentStep": {{
                    "traceId": "t1",
                    "stepId": "{step_id}",
                    "image": "aGk=",
                    "duration": 1.0,
                    "inputTokensUsed": 10,
                    "outputTokensUsed": 5,
                    "step_evaluation": "neutral"
                }},
                "traceMetadata": {{"traceId": "t1", "numberOfSteps": 1, "maxSteps": 50}}
            }}"#
        )
    }

    /// The end-to-end ordering scenario: heartbeat, start, duplicate
    /// progress, complete — one step, outcome success.
    #[test]
    fn duplicate_progress_yields_a_single_step_and_success() {
        let mut store = TraceStore::new();

        apply_text(&mut store, r#"{"type":"heartbeat","uuid":"t1"}"#);
        assert_eq!(store.pending_trace_id(), Some("t1"));

        apply_text(
            &mut store,
            r#"{
                "type": "agent_start",
                "agentTrace": {
                    "id": "t1",
                    "timestamp": "2026-08-30T12:00:00Z",
                    "instruction": "open the settings page",
                    "modelId": "gpt-test",
                    "isRunning": true,
                    "steps": []
                }
            }"#,
        );
        assert_eq!(store.phase(), TracePhase::AwaitingSandbox);

        apply_text(&mut store, &progress("s1"));
        apply_text(&mut store, &progress("s1"));
        assert_eq!(store.phase(), TracePhase::Running);
        assert_eq!(store.trace().unwrap().steps.len(), 1);

        apply_text(
            &mut store,
            r#"{
                "type": "agent_complete",
                "traceMetadata": {"traceId": "t1", "numberOfSteps": 1, "maxSteps": 50, "completed": true},
                "final_state": "success"
            }"#,
        );
        let outcome = store.outcome().unwrap();
        assert_eq!(outcome.outcome, Outcome::Success);
        assert_eq!(store.trace().unwrap().steps.len(), 1);
        assert_eq!(store.trace().unwrap().metadata.max_steps, 50);
    }

    #[test]
    fn vnc_events_toggle_the_live_view_url() {
        let mut store = TraceStore::new();
        apply_text(&mut store, r#"{"type":"heartbeat","uuid":"t1"}"#);
        apply_text(
            &mut store,
            r#"{"type":"vnc_url_set","vncUrl":"https://sandbox/vnc"}"#,
        );
        assert_eq!(store.vnc_url(), Some("https://sandbox/vnc"));
        apply_text(&mut store, r#"{"type":"vnc_url_unset"}"#);
        assert_eq!(store.vnc_url(), None);
    }

    #[test]
    fn agent_error_event_becomes_a_failure_outcome() {
        let mut store = TraceStore::new();
        apply_text(&mut store, r#"{"type":"heartbeat","uuid":"t1"}"#);
        apply_text(
            &mut store,
            r#"{"type":"agent_error","error":"sandbox allocation failed"}"#,
        );
        let outcome = store.outcome().unwrap();
        assert_eq!(outcome.outcome, Outcome::Failure);
        assert_eq!(outcome.message, "sandbox allocation failed");
    }

    struct ApplyHarness {
        tx: mpsc::Sender<ConnEvent>,
        store: Arc<Mutex<TraceStore>>,
        notices: Arc<Mutex<Vec<Notice>>>,
        changes: Arc<watch::Sender<u64>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_apply_loop() -> ApplyHarness {
        let (tx, rx) = mpsc::channel(8);
        let store = Arc::new(Mutex::new(TraceStore::new()));
        let notices = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(watch::channel(0u64).0);
        let task = tokio::spawn(apply_loop(
            rx,
            Arc::clone(&store),
            Arc::clone(&notices),
            Arc::clone(&changes),
        ));
        ApplyHarness {
            tx,
            store,
            notices,
            changes,
            task,
        }
    }

    #[tokio::test]
    async fn apply_loop_clears_trace_id_on_disconnect() {
        let ApplyHarness {
            tx, store, task, ..
        } = spawn_apply_loop();

        tx.send(ConnEvent::Message(
            r#"{"type":"heartbeat","uuid":"t1"}"#.into(),
        ))
        .await
        .unwrap();
        tx.send(ConnEvent::StateChanged(ConnectionState::Disconnected))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(store.lock().await.pending_trace_id(), None);
    }

    #[tokio::test]
    async fn apply_loop_queues_notices_and_survives_garbage() {
        let ApplyHarness {
            tx, notices, task, ..
        } = spawn_apply_loop();

        tx.send(ConnEvent::Message("not json at all".into()))
            .await
            .unwrap();
        tx.send(ConnEvent::Message(r#"{"type":"future_thing"}"#.into()))
            .await
            .unwrap();
        tx.send(ConnEvent::SurfacedError("connect refused".into()))
            .await
            .unwrap();
        tx.send(ConnEvent::RetriesExhausted).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let queued = std::mem::take(&mut *notices.lock().await);
        assert_eq!(
            queued,
            vec![
                Notice::TransportError("connect refused".into()),
                Notice::RetriesExhausted
            ]
        );
    }

    /// A change published before the reader gets around to waiting must
    /// still wake the reader. A terminal `agent_complete` can be the last
    /// event a trace ever produces, so a lost notification would strand the
    /// reader forever.
    #[tokio::test]
    async fn change_published_before_wait_still_wakes_the_reader() {
        let ApplyHarness {
            tx,
            changes,
            task,
            notices,
            ..
        } = spawn_apply_loop();
        let mut reader = changes.subscribe();

        // The event lands while the reader is "busy" (not yet awaiting).
        tx.send(ConnEvent::RetriesExhausted).await.unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(
            std::mem::take(&mut *notices.lock().await),
            vec![Notice::RetriesExhausted]
        );

        // Only now does the reader wait; the epoch bump is still pending.
        tokio::time::timeout(std::time::Duration::from_secs(1), reader.changed())
            .await
            .expect("reader never woke for a change published before the wait")
            .expect("change publisher dropped");
    }

    #[tokio::test]
    async fn dark_mode_preference_reaches_the_shared_state() {
        let config = ViewerConfig {
            base_url: "http://127.0.0.1:1".into(),
        };
        let viewer = Viewer::connect(&config).unwrap();
        let mut reader = viewer.subscribe();

        viewer.set_dark_mode(true).await;

        assert!(viewer.snapshot().await.dark_mode);
        assert!(reader.has_changed().unwrap());
    }
}
