//! Configuration loading for cuaview.
//!
//! The backend endpoint is resolved from three fallback sources (tried in
//! order):
//!
//! 1. **JSON file** via `--config <path>` CLI flag
//! 2. **JSON file** via `CUAVIEW_CONFIG` environment variable
//! 3. **Environment variable** `CUAVIEW_URL` (falling back to the local
//!    development backend when unset)
//!
//! A single HTTP base URL covers both surfaces: the REST routes live under
//! it directly and the WebSocket endpoint is derived by swapping the scheme
//! and appending `/ws`.

use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_URL: &str = "http://127.0.0.1:8000";

/// CLI arguments parsed by `clap`.
#[derive(Parser)]
#[command(name = "cuaview", about = "Live trace viewer for Computer Use Agent runs")]
pub struct Cli {
    /// Path to a config file (JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backend base URL (overrides config file and environment)
    #[arg(long)]
    pub url: Option<String>,

    /// Task instruction to dispatch once connected
    #[arg(long)]
    pub task: Option<String>,

    /// Ask the backend for a random task instruction instead of --task
    #[arg(long, conflicts_with = "task")]
    pub random_task: bool,

    /// Model id to run the task with (defaults to the first catalog entry)
    #[arg(long)]
    pub model: Option<String>,

    /// Directory to write the export bundle into when the trace completes
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// Raw JSON config file structure.
#[derive(Deserialize)]
struct ConfigFile {
    url: String,
}

/// Validated configuration ready for use by the viewer.
#[derive(Debug, Clone)]
pub struct ViewerConfig {
    /// HTTP base URL of the backend, without trailing slash.
    pub base_url: String,
}

impl ViewerConfig {
    /// The WebSocket endpoint derived from the HTTP base URL.
    pub fn ws_url(&self) -> Result<String, String> {
        build_ws_url(&self.base_url)
    }
}

/// Resolve configuration from CLI args, config file, or environment.
pub fn load_config(cli: &Cli) -> Result<ViewerConfig, String> {
    if let Some(url) = &cli.url {
        return validated(url.clone());
    }
    if let Some(path) = &cli.config {
        return load_from_file(&expand_tilde(path));
    }
    if let Ok(path) = std::env::var("CUAVIEW_CONFIG") {
        return load_from_file(&expand_tilde(Path::new(&path)));
    }
    let url = std::env::var("CUAVIEW_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    validated(url)
}

fn validated(url: String) -> Result<ViewerConfig, String> {
    let url = url.trim_end_matches('/').to_string();
    if url.is_empty() {
        return Err("backend URL is empty".into());
    }
    // Fail early on URLs the WebSocket derivation cannot handle.
    build_ws_url(&url)?;
    Ok(ViewerConfig { base_url: url })
}

fn load_from_file(path: &Path) -> Result<ViewerConfig, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read config file {}: {}", path.display(), e))?;
    let config: ConfigFile = serde_json::from_str(&contents)
        .map_err(|e| format!("failed to parse config file {}: {}", path.display(), e))?;
    validated(config.url)
}

/// Expand a leading `~` to `$HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Build the WebSocket URL from the HTTP base URL.
fn build_ws_url(base_url: &str) -> Result<String, String> {
    let base = base_url.trim_end_matches('/');
    let ws_base = if base.starts_with("https://") {
        base.replacen("https://", "wss://", 1)
    } else if base.starts_with("http://") {
        base.replacen("http://", "ws://", 1)
    } else {
        return Err(format!("invalid URL scheme: {}", base));
    };
    Ok(format!("{}/ws", ws_base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_swaps_scheme_and_appends_path() {
        assert_eq!(
            build_ws_url("http://localhost:8000").unwrap(),
            "ws://localhost:8000/ws"
        );
        assert_eq!(
            build_ws_url("https://cua.example.org/").unwrap(),
            "wss://cua.example.org/ws"
        );
    }

    #[test]
    fn bad_scheme_is_rejected() {
        assert!(build_ws_url("ftp://nope").is_err());
        assert!(validated("gopher://nope".into()).is_err());
    }

    #[test]
    fn validated_strips_trailing_slash() {
        let config = validated("http://localhost:8000///".into()).unwrap();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert_eq!(config.ws_url().unwrap(), "ws://localhost:8000/ws");
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cuaview.json");
        std::fs::write(&path, r#"{"url": "http://10.0.0.5:8000"}"#).unwrap();
        let config = load_from_file(&path).unwrap();
        assert_eq!(config.base_url, "http://10.0.0.5:8000");
    }

    #[test]
    fn missing_config_file_is_a_readable_error() {
        let err = load_from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(err.contains("failed to read config file"));
    }
}
