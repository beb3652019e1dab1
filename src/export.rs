//! Export of a finished (or in-flight) trace to disk.
//!
//! The bundle mirrors the backend's own archival layout: one directory per
//! trace (`trace-{id}-{model}`) containing `tasks.json` plus one decoded PNG
//! per step. In the JSON, step images are replaced by their file names
//! (`{traceId}-{stepId}.png`) so the document stays small and the images are
//! usable by screenshot/GIF tooling directly.
//!
//! This module only reads the ordered step list — it has no say in trace
//! state.

use std::path::{Path, PathBuf};

use base64::Engine;
use serde_json::{json, Value};
use tracing::debug;

use crate::trace::AgentTrace;

/// Errors from bundle export.
#[derive(Debug)]
pub enum ExportError {
    Io(std::io::Error),
    /// A step's image payload was not valid base64.
    Image {
        step_id: String,
        source: base64::DecodeError,
    },
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Io(e) => write!(f, "export I/O error: {}", e),
            ExportError::Image { step_id, source } => {
                write!(f, "step {} has an undecodable image: {}", step_id, source)
            }
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

/// File name a step's image is written under.
fn image_file_name(trace_id: &str, step_id: &str) -> String {
    format!("{}-{}.png", trace_id, step_id)
}

/// Serialize a trace with each step's inline image replaced by its bundle
/// file name.
pub fn trace_to_json(trace: &AgentTrace) -> Value {
    let mut steps = Vec::with_capacity(trace.steps.len());
    for step in &trace.steps {
        let mut value = serde_json::to_value(step).unwrap_or_default();
        value["image"] = json!(image_file_name(&step.trace_id, &step.step_id));
        steps.push(value);
    }

    json!({
        "message_id": trace.id,
        "instruction": trace.instruction,
        "model_id": trace.model_id,
        "timestamp": trace.timestamp,
        "steps": steps,
        "traceMetadata": trace.metadata,
    })
}

/// Write `tasks.json` and all step screenshots under
/// `dir/trace-{id}-{model}/`. Returns the bundle directory.
pub fn write_bundle(dir: &Path, trace: &AgentTrace) -> Result<PathBuf, ExportError> {
    let bundle = dir.join(format!(
        "trace-{}-{}",
        trace.id,
        trace.model_id.replace('/', "-")
    ));
    std::fs::create_dir_all(&bundle)?;

    let document = serde_json::to_string_pretty(&trace_to_json(trace)).unwrap_or_default();
    std::fs::write(bundle.join("tasks.json"), document)?;

    for step in &trace.steps {
        let payload = strip_data_url_prefix(&step.image);
        if payload.is_empty() {
            continue;
        }
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|source| ExportError::Image {
                step_id: step.step_id.clone(),
                source,
            })?;
        std::fs::write(
            bundle.join(image_file_name(&step.trace_id, &step.step_id)),
            bytes,
        )?;
    }

    debug!(bundle = %bundle.display(), steps = trace.steps.len(), "wrote export bundle");
    Ok(bundle)
}

/// Step images may arrive as bare base64 or as a `data:` URL; accept both.
fn strip_data_url_prefix(image: &str) -> &str {
    match image.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => image,
    }
}
