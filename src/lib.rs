//! Core of the cuaview live trace viewer.
//!
//! Connects to a Computer Use Agent backend over WebSocket, maintains the
//! authoritative local model of the current trace, and exposes snapshots and
//! commands to whatever front end sits on top (the bundled terminal binary,
//! or a GUI).
//!
//! ## Modules
//!
//! ```text
//! config.rs     — JSON file / env-var configuration loading
//! client.rs     — HTTP client for the backend REST endpoints
//! connection.rs — WebSocket client with bounded auto-reconnect
//! protocol.rs   — typed decode/encode of the tagged-JSON wire messages
//! trace.rs      — agent trace data model and lifecycle state machine
//! view.rs       — live/inspect view mode logic and UI timers (pure data)
//! viewer.rs     — glue: apply loop, snapshots, outbound commands
//! export.rs     — on-disk export bundle (tasks.json + step screenshots)
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod export;
pub mod protocol;
pub mod trace;
pub mod view;
pub mod viewer;
