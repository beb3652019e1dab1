//! WebSocket connection manager with bounded auto-reconnect.
//!
//! [`ConnectionManager`] owns at most one live transport to the cua-core
//! backend. On unexpected closure it reconnects with exponential backoff and
//! jitter, bounded by an attempt budget; after the budget is exhausted it
//! parks in the `Error` state until [`ConnectionManager::manual_reconnect`].
//!
//! ## Error surfacing
//!
//! Errors on the very first connection attempt are suppressed — a user
//! opening the viewer before the backend is up should not see an error
//! toast. The suppression is cleared by the first successful open, or by a
//! manual reconnect. Surfaced errors are throttled to one per 5-second
//! window so a flapping connection cannot storm the UI.
//!
//! The I/O loop delivers raw inbound frames and state transitions as
//! [`ConnEvent`]s on an `mpsc` channel; decoding happens downstream.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Reconnect schedule: `delay(n) = min(base · 2^n, cap) + jitter`.
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 10_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Fixed delay before a manual reconnect tears into a fresh connection.
const MANUAL_RECONNECT_DELAY_MS: u64 = 250;
/// At most one surfaced error per window.
const ERROR_SURFACE_WINDOW: Duration = Duration::from_secs(5);

/// Transport lifecycle, independent of any trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; only a manual reconnect leaves this state.
    Error,
}

/// Events delivered to the viewer's apply loop.
#[derive(Debug)]
pub enum ConnEvent {
    StateChanged(ConnectionState),
    /// Raw inbound text frame.
    Message(String),
    /// A transport error that passed suppression and throttling.
    SurfacedError(String),
    /// Automatic retries are exhausted; the UI should offer manual reconnect.
    RetriesExhausted,
}

/// Bounded exponential backoff with additive jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: BACKOFF_BASE_MS,
            cap_ms: BACKOFF_CAP_MS,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed), with the caller's
    /// jitter added on top of the capped exponential.
    pub fn delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(self.cap_ms);
        Duration::from_millis(exp + jitter_ms)
    }
}

/// Jitter in `[0, 1000)` ms derived from the system clock's nanoseconds.
fn clock_jitter_ms() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % 1_000
}

/// Decides whether a transport error is shown to the user.
#[derive(Debug)]
struct ErrorGate {
    /// Suppress until the first successful open (or manual reconnect).
    suppress: bool,
    last_surfaced: Option<Instant>,
}

impl ErrorGate {
    fn new() -> Self {
        Self {
            suppress: true,
            last_surfaced: None,
        }
    }

    /// First successful open: subsequent errors are real regressions.
    fn on_connected(&mut self) {
        self.suppress = false;
    }

    /// Manual reconnect: the user asked, so always tell them what happened.
    fn clear_suppression(&mut self) {
        self.suppress = false;
    }

    fn should_surface(&mut self, now: Instant) -> bool {
        if self.suppress {
            return false;
        }
        match self.last_surfaced {
            Some(last) if now.duration_since(last) < ERROR_SURFACE_WINDOW => false,
            _ => {
                self.last_surfaced = Some(now);
                true
            }
        }
    }
}

enum Cmd {
    Send(String),
    Reconnect,
    Shutdown,
}

/// Handle to the connection I/O task.
pub struct ConnectionManager {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawn the I/O task and begin connecting to `ws_url`. There is exactly
    /// one socket per manager; a second `connect` means a second manager.
    pub fn connect(ws_url: String, events: mpsc::Sender<ConnEvent>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        tokio::spawn(
            IoLoop {
                url: ws_url,
                events,
                state_tx,
                cmd_rx,
                backoff: BackoffPolicy::default(),
                gate: ErrorGate::new(),
                attempts: 0,
            }
            .run(),
        );

        Self { cmd_tx, state_rx }
    }

    /// Current transport state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch for transport state changes.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Queue an outbound text frame. Fails only if the I/O task is gone.
    pub async fn send(&self, text: String) -> Result<(), String> {
        self.cmd_tx
            .send(Cmd::Send(text))
            .await
            .map_err(|_| "connection task is gone".to_string())
    }

    /// Force-close any existing connection, reset the attempt budget, and
    /// reconnect after a short fixed delay. Error suppression is cleared.
    pub async fn manual_reconnect(&self) {
        let _ = self.cmd_tx.send(Cmd::Reconnect).await;
    }

    /// Close normally. No automatic retry follows our own closure.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Cmd::Shutdown).await;
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Why `drive` returned.
enum DriveExit {
    /// We sent our own normal closure.
    Shutdown,
    /// Manual reconnect requested while connected.
    Reconnect,
    /// Unexpected close or transport error.
    Lost(String),
}

struct IoLoop {
    url: String,
    events: mpsc::Sender<ConnEvent>,
    state_tx: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::Receiver<Cmd>,
    backoff: BackoffPolicy,
    gate: ErrorGate,
    attempts: u32,
}

impl IoLoop {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting).await;

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((stream, _)) => {
                    self.attempts = 0;
                    self.gate.on_connected();
                    info!(url = %self.url, "websocket connected");
                    self.set_state(ConnectionState::Connected).await;

                    match self.drive(stream).await {
                        DriveExit::Shutdown => {
                            self.set_state(ConnectionState::Disconnected).await;
                            if !self.park().await {
                                return;
                            }
                        }
                        DriveExit::Reconnect => {
                            self.prepare_manual_reconnect().await;
                        }
                        DriveExit::Lost(reason) => {
                            self.set_state(ConnectionState::Disconnected).await;
                            self.report_error(&reason).await;
                            if !self.backoff_or_park().await {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    let reason = format!("websocket connect failed: {}", e);
                    self.report_error(&reason).await;
                    if !self.backoff_or_park().await {
                        return;
                    }
                }
            }
        }
    }

    /// Connected steady state: pump inbound frames and outbound commands.
    async fn drive(&mut self, stream: WsStream) -> DriveExit {
        let (mut sink, mut reader) = stream.split();

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if self.events.send(ConnEvent::Message(text)).await.is_err() {
                            return DriveExit::Shutdown;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = match frame {
                            Some(f) => format!("closed by server ({})", f.code),
                            None => "closed by server".to_string(),
                        };
                        return DriveExit::Lost(reason);
                    }
                    Some(Ok(_)) => {} // Binary/Ping/Pong — ignore
                    Some(Err(e)) => return DriveExit::Lost(format!("websocket error: {}", e)),
                    None => return DriveExit::Lost("websocket stream ended".to_string()),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Send(text)) => {
                        if let Err(e) = sink.send(Message::Text(text)).await {
                            return DriveExit::Lost(format!("websocket send failed: {}", e));
                        }
                    }
                    Some(Cmd::Reconnect) => {
                        let _ = sink.send(close_frame()).await;
                        return DriveExit::Reconnect;
                    }
                    Some(Cmd::Shutdown) | None => {
                        let _ = sink.send(close_frame()).await;
                        return DriveExit::Shutdown;
                    }
                },
            }
        }
    }

    /// After an unexpected loss: retry on the backoff schedule, or park in
    /// `Error` once the budget is spent. Returns `false` on shutdown.
    async fn backoff_or_park(&mut self) -> bool {
        if self.attempts >= self.backoff.max_attempts {
            warn!(
                attempts = self.attempts,
                "reconnect budget exhausted, giving up until manual reconnect"
            );
            self.set_state(ConnectionState::Error).await;
            let _ = self.events.send(ConnEvent::RetriesExhausted).await;
            return self.park().await;
        }

        let delay = self.backoff.delay(self.attempts, clock_jitter_ms());
        self.attempts += 1;
        debug!(attempt = self.attempts, ?delay, "scheduling reconnect");

        let retry_at = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(retry_at) => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Cmd::Reconnect) => {
                        self.prepare_manual_reconnect().await;
                        return true;
                    }
                    Some(Cmd::Shutdown) | None => return false,
                    Some(Cmd::Send(_)) => {
                        warn!("dropping outbound message while disconnected");
                    }
                },
            }
        }
    }

    /// Parked with no pending retry (normal closure or exhausted budget).
    /// Only a manual reconnect resumes. Returns `false` on shutdown.
    async fn park(&mut self) -> bool {
        loop {
            match self.cmd_rx.recv().await {
                Some(Cmd::Reconnect) => {
                    self.prepare_manual_reconnect().await;
                    return true;
                }
                Some(Cmd::Shutdown) | None => return false,
                Some(Cmd::Send(_)) => {
                    warn!("dropping outbound message while disconnected");
                }
            }
        }
    }

    async fn prepare_manual_reconnect(&mut self) {
        info!("manual reconnect requested");
        self.attempts = 0;
        self.gate.clear_suppression();
        self.set_state(ConnectionState::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(MANUAL_RECONNECT_DELAY_MS)).await;
    }

    async fn set_state(&mut self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
        let _ = self.events.send(ConnEvent::StateChanged(state)).await;
    }

    async fn report_error(&mut self, reason: &str) {
        warn!(%reason, "transport error");
        if self.gate.should_surface(Instant::now()) {
            let _ = self
                .events
                .send(ConnEvent::SurfacedError(reason.to_string()))
                .await;
        }
    }
}

fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client shutdown".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_exponential_within_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            let floor = Duration::from_millis((BACKOFF_BASE_MS << attempt).min(BACKOFF_CAP_MS));
            let ceiling = floor + Duration::from_millis(1_000);
            let delay = policy.delay(attempt, 999);
            assert!(delay >= floor, "attempt {}: {:?} < {:?}", attempt, delay, floor);
            assert!(delay < ceiling, "attempt {}: {:?} >= {:?}", attempt, delay, ceiling);
        }
    }

    #[test]
    fn backoff_delay_is_capped() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay(30, 0);
        assert_eq!(delay, Duration::from_millis(BACKOFF_CAP_MS));
    }

    #[test]
    fn backoff_survives_absurd_attempt_numbers() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(64, 0), Duration::from_millis(BACKOFF_CAP_MS));
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..64 {
            assert!(clock_jitter_ms() < 1_000);
        }
    }

    #[tokio::test]
    async fn error_gate_suppresses_until_first_success() {
        let mut gate = ErrorGate::new();
        assert!(!gate.should_surface(Instant::now()));
        gate.on_connected();
        assert!(gate.should_surface(Instant::now()));
    }

    #[tokio::test]
    async fn error_gate_throttles_to_one_per_window() {
        let mut gate = ErrorGate::new();
        gate.on_connected();

        let now = Instant::now();
        assert!(gate.should_surface(now));
        assert!(!gate.should_surface(now + Duration::from_secs(2)));
        assert!(gate.should_surface(now + Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn error_gate_manual_reconnect_clears_suppression() {
        let mut gate = ErrorGate::new();
        assert!(!gate.should_surface(Instant::now()));
        gate.clear_suppression();
        assert!(gate.should_surface(Instant::now()));
    }
}
