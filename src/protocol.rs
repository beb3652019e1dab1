//! Wire protocol for the cua-core WebSocket connection.
//!
//! Every message is a JSON object with a `"type"` discriminator. Unknown
//! types are ignored (forward compatible); a known type with a malformed
//! payload is a protocol error the caller logs and drops.
//!
//! ## Message types (server → client)
//!
//! | Type            | Payload                        |
//! |-----------------|--------------------------------|
//! | `heartbeat`     | `uuid` — pending trace id      |
//! | `agent_start`   | `agentTrace`, `status`         |
//! | `agent_progress`| `agentStep`, `traceMetadata`   |
//! | `agent_complete`| `traceMetadata`, `final_state` |
//! | `agent_error`   | `error`                        |
//! | `vnc_url_set`   | `vncUrl`                       |
//! | `vnc_url_unset` | —                              |
//!
//! ## Message types (client → server)
//!
//! | Type        | Payload    |
//! |-------------|------------|
//! | `user_task` | `trace`    |
//! | `stop_task` | `trace_id` |
//!
//! The server guarantees per-trace ordering (`agent_start` first,
//! `agent_complete`/`agent_error` last) but not exactly-once delivery;
//! duplicate `agent_progress` events are handled downstream by step-id
//! deduplication.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::trace::{AgentStep, AgentTrace, FinalState, StartStatus, TraceMetadata};

/// Decoded inbound protocol event.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Heartbeat {
        uuid: String,
    },
    AgentStart {
        trace: AgentTrace,
        status: StartStatus,
    },
    AgentProgress {
        step: AgentStep,
        metadata: TraceMetadata,
    },
    AgentComplete {
        metadata: TraceMetadata,
        final_state: FinalState,
    },
    AgentError {
        error: String,
    },
    VncUrlSet {
        url: String,
    },
    VncUrlUnset,
}

/// Why an inbound message could not be decoded.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame was not valid JSON.
    Json(serde_json::Error),
    /// The JSON object carried no string `"type"` field.
    MissingType,
    /// A known type whose payload did not match the expected shape.
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Json(e) => write!(f, "invalid JSON frame: {}", e),
            DecodeError::MissingType => write!(f, "message has no \"type\" field"),
            DecodeError::Payload { kind, source } => {
                write!(f, "malformed {} payload: {}", kind, source)
            }
        }
    }
}

#[derive(Deserialize)]
struct HeartbeatPayload {
    uuid: String,
}

#[derive(Deserialize)]
struct StartPayload {
    #[serde(rename = "agentTrace")]
    agent_trace: AgentTrace,
    #[serde(default)]
    status: StartStatus,
}

#[derive(Deserialize)]
struct ProgressPayload {
    #[serde(rename = "agentStep")]
    agent_step: AgentStep,
    #[serde(rename = "traceMetadata", default)]
    trace_metadata: TraceMetadata,
}

#[derive(Deserialize)]
struct CompletePayload {
    #[serde(rename = "traceMetadata", default)]
    trace_metadata: TraceMetadata,
    final_state: FinalState,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: String,
}

#[derive(Deserialize)]
struct VncUrlSetPayload {
    #[serde(rename = "vncUrl")]
    vnc_url: String,
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: &'static str,
    value: Value,
) -> Result<T, DecodeError> {
    serde_json::from_value(value).map_err(|source| DecodeError::Payload { kind, source })
}

/// Decode one inbound frame. `Ok(None)` means an unknown type that should be
/// silently ignored.
pub fn decode_event(text: &str) -> Result<Option<ServerEvent>, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "heartbeat" => {
            let p: HeartbeatPayload = payload("heartbeat", value)?;
            ServerEvent::Heartbeat { uuid: p.uuid }
        }
        "agent_start" => {
            let p: StartPayload = payload("agent_start", value)?;
            ServerEvent::AgentStart {
                trace: p.agent_trace,
                status: p.status,
            }
        }
        "agent_progress" => {
            let p: ProgressPayload = payload("agent_progress", value)?;
            ServerEvent::AgentProgress {
                step: p.agent_step,
                metadata: p.trace_metadata,
            }
        }
        "agent_complete" => {
            let p: CompletePayload = payload("agent_complete", value)?;
            ServerEvent::AgentComplete {
                metadata: p.trace_metadata,
                final_state: p.final_state,
            }
        }
        "agent_error" => {
            let p: ErrorPayload = payload("agent_error", value)?;
            ServerEvent::AgentError { error: p.error }
        }
        "vnc_url_set" => {
            let p: VncUrlSetPayload = payload("vnc_url_set", value)?;
            ServerEvent::VncUrlSet { url: p.vnc_url }
        }
        "vnc_url_unset" => ServerEvent::VncUrlUnset,
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Encode a `user_task` command dispatching a new task.
pub fn encode_user_task(trace: &AgentTrace) -> String {
    json!({
        "type": "user_task",
        "trace": trace,
    })
    .to_string()
}

/// Encode a `stop_task` cancellation request. This is a request, not a state
/// transition — the authoritative `stopped` state arrives later as an
/// `agent_complete`.
pub fn encode_stop_task(trace_id: &str) -> String {
    json!({
        "type": "stop_task",
        "trace_id": trace_id,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_decodes() {
        let event = decode_event(r#"{"type":"heartbeat","uuid":"t1"}"#).unwrap();
        match event {
            Some(ServerEvent::Heartbeat { uuid }) => assert_eq!(uuid, "t1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn agent_start_decodes_with_default_status() {
        let text = r#"{
            "type": "agent_start",
            "agentTrace": {
                "id": "t1",
                "timestamp": "2026-08-30T12:00:00Z",
                "instruction": "open the settings page",
                "modelId": "gpt-test",
                "isRunning": true,
                "steps": []
            }
        }"#;
        match decode_event(text).unwrap() {
            Some(ServerEvent::AgentStart { trace, status }) => {
                assert_eq!(trace.id, "t1");
                assert_eq!(status, StartStatus::Success);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn agent_start_decodes_max_sandboxes_status() {
        let text = r#"{
            "type": "agent_start",
            "status": "max_sandboxes_reached",
            "agentTrace": {
                "id": "t1",
                "timestamp": "2026-08-30T12:00:00Z",
                "instruction": "x",
                "modelId": "m",
                "isRunning": false
            }
        }"#;
        match decode_event(text).unwrap() {
            Some(ServerEvent::AgentStart { status, .. }) => {
                assert_eq!(status, StartStatus::MaxSandboxesReached)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn agent_complete_decodes_final_state() {
        let text = r#"{
            "type": "agent_complete",
            "traceMetadata": {"traceId": "t1", "numberOfSteps": 4, "maxSteps": 50},
            "final_state": "max_steps_reached"
        }"#;
        match decode_event(text).unwrap() {
            Some(ServerEvent::AgentComplete {
                metadata,
                final_state,
            }) => {
                assert_eq!(metadata.step_count, 4);
                assert_eq!(final_state, FinalState::MaxStepsReached);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_ignored() {
        assert!(decode_event(r#"{"type":"shiny_new_event","x":1}"#)
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_type_is_an_error() {
        assert!(matches!(
            decode_event(r#"{"uuid":"t1"}"#),
            Err(DecodeError::MissingType)
        ));
    }

    #[test]
    fn malformed_payload_names_the_kind() {
        let err = decode_event(r#"{"type":"agent_error"}"#).unwrap_err();
        match err {
            DecodeError::Payload { kind, .. } => assert_eq!(kind, "agent_error"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(matches!(
            decode_event("not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn user_task_envelope_has_type_and_trace() {
        let trace = AgentTrace::new("t1".into(), "do the thing".into(), "gpt-test".into());
        let encoded: Value = serde_json::from_str(&encode_user_task(&trace)).unwrap();
        assert_eq!(encoded["type"], "user_task");
        assert_eq!(encoded["trace"]["id"], "t1");
        assert_eq!(encoded["trace"]["modelId"], "gpt-test");
        assert_eq!(encoded["trace"]["traceMetadata"]["traceId"], "t1");
    }

    #[test]
    fn stop_task_envelope_carries_trace_id() {
        let encoded: Value = serde_json::from_str(&encode_stop_task("t1")).unwrap();
        assert_eq!(encoded["type"], "stop_task");
        assert_eq!(encoded["trace_id"], "t1");
    }
}
