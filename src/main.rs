//! # cuaview
//!
//! Terminal live viewer for Computer Use Agent runs. Connects to the agent
//! backend over WebSocket, dispatches a task, and streams the agent's steps
//! (thoughts, actions, token usage) to stdout as they happen.

use std::time::Duration;

use clap::Parser;
use tokio::time::Instant;
use tracing::{info, warn};

use cuaview::client::CoreClient;
use cuaview::config::{self, Cli};
use cuaview::connection::ConnectionState;
use cuaview::export;
use cuaview::trace::{TracePhase, TraceSnapshot};
use cuaview::view::ThinkingTimer;
use cuaview::viewer::{Notice, Viewer};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("cuaview: configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "cuaview=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!("cuaview v{} starting", env!("CARGO_PKG_VERSION"));
    info!("backend: {}", config.base_url);

    match CoreClient::new(&config.base_url).health().await {
        Ok(_) => info!("backend is healthy"),
        Err(e) => warn!(error = %e, "backend health check failed, connecting anyway"),
    }

    let viewer = match Viewer::connect(&config) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("cuaview: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&viewer, &cli).await {
        eprintln!("cuaview: {}", e);
        viewer.disconnect().await;
        std::process::exit(1);
    }
    viewer.disconnect().await;
}

async fn run(viewer: &Viewer, cli: &Cli) -> Result<(), String> {
    let models = match viewer.load_models().await {
        Ok(models) => models,
        Err(e) => {
            warn!(error = %e, "could not fetch model catalog");
            Vec::new()
        }
    };

    let instruction = resolve_instruction(viewer, cli).await?;
    if let Some(instruction) = &instruction {
        let model = match &cli.model {
            Some(model) => model.clone(),
            None => models
                .first()
                .cloned()
                .ok_or("no model catalog available; pass --model explicitly")?,
        };

        wait_for_heartbeat(viewer).await?;
        let trace_id = viewer
            .dispatch_task(instruction, &model)
            .await
            .map_err(|e| e.to_string())?;
        println!("task dispatched as trace {} (model {})", trace_id, model);
        println!("  {}", instruction);
    } else {
        println!("no task given; watching for agent activity (ctrl-c to quit)");
    }

    stream_trace(viewer, cli).await
}

/// Resolve the task instruction: `--task` verbatim, `--random-task` from the
/// backend's pool, otherwise none (observe-only mode).
async fn resolve_instruction(viewer: &Viewer, cli: &Cli) -> Result<Option<String>, String> {
    if let Some(task) = &cli.task {
        return Ok(Some(task.clone()));
    }
    if cli.random_task {
        let instruction = viewer
            .random_instruction()
            .await
            .map_err(|e| format!("random task: {}", e))?;
        return Ok(Some(instruction));
    }
    Ok(None)
}

/// Dispatching needs the heartbeat-assigned trace id. The backend sends it
/// right after the socket opens, so a missing heartbeat within the window
/// means the connection never came up.
async fn wait_for_heartbeat(viewer: &Viewer) -> Result<(), String> {
    // Subscribe before the first snapshot so a heartbeat landing between
    // the check and the wait still wakes us.
    let mut changes = viewer.subscribe();
    let deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(deadline);
    loop {
        if viewer.snapshot().await.pending_trace_id.is_some() {
            return Ok(());
        }
        if viewer.connection_state() == ConnectionState::Error {
            return Err("connection failed before a trace id was assigned".into());
        }
        tokio::select! {
            _ = changes.changed() => {}
            _ = &mut deadline => {
                // The heartbeat may have raced the deadline.
                if viewer.snapshot().await.pending_trace_id.is_some() {
                    return Ok(());
                }
                return Err("timed out waiting for a trace id".into());
            }
        }
    }
}

/// The render loop: wake on state changes, print newly arrived steps, show a
/// thinking indicator when the agent goes quiet, and stop on ctrl-c or a
/// terminal outcome.
async fn stream_trace(viewer: &Viewer, cli: &Cli) -> Result<(), String> {
    // Taken before the first snapshot: a change published while this loop
    // is mid-body (a terminal outcome, say) resolves the next `changed()`
    // immediately instead of being lost.
    let mut changes = viewer.subscribe();
    let mut printed_steps = 0usize;
    let mut vnc_announced = false;
    let mut thinking = ThinkingTimer::new();
    let mut thinking_shown = false;
    let mut stop_requested = false;

    loop {
        let now = Instant::now();
        let snapshot = viewer.snapshot().await;

        for notice in viewer.take_notices().await {
            match notice {
                Notice::TransportError(message) => eprintln!("connection: {}", message),
                Notice::RetriesExhausted => {
                    return Err("connection lost after repeated failures".into());
                }
            }
        }

        render_new_steps(&snapshot, &mut printed_steps, &mut thinking, now);
        if printed_steps > 0 || snapshot.phase == TracePhase::Running {
            thinking.on_streaming(now);
        }
        if !thinking.visible(now) {
            thinking_shown = false;
        }

        match (&snapshot.vnc_url, vnc_announced) {
            (Some(url), false) => {
                println!("sandbox live view: {}", url);
                vnc_announced = true;
            }
            (None, true) => vnc_announced = false,
            _ => {}
        }

        if let Some(outcome) = &snapshot.outcome {
            println!();
            println!("outcome: {:?}: {}", outcome.outcome, outcome.message);
            println!(
                "steps: {}/{}  tokens: {} in / {} out",
                outcome.metadata.step_count,
                outcome.metadata.max_steps,
                outcome.metadata.input_tokens,
                outcome.metadata.output_tokens
            );
            if let (Some(dir), Some(trace)) = (&cli.export, &snapshot.trace) {
                let bundle = export::write_bundle(dir, trace).map_err(|e| e.to_string())?;
                println!("exported to {}", bundle.display());
            }
            return Ok(());
        }

        if thinking.visible(now) && !thinking_shown {
            println!("  (agent is thinking...)");
            thinking_shown = true;
        }

        let wake = thinking.deadline().filter(|_| !thinking_shown);
        tokio::select! {
            _ = changes.changed() => {}
            _ = sleep_until_opt(wake) => {}
            _ = tokio::signal::ctrl_c() => {
                if stop_requested || !snapshot_running(&snapshot) {
                    println!("quitting");
                    return Ok(());
                }
                stop_requested = true;
                println!("stopping task (ctrl-c again to quit)");
                if let Err(e) = viewer.stop_task().await {
                    warn!(error = %e, "stop request not sent");
                }
            }
        }
    }
}

fn snapshot_running(snapshot: &TraceSnapshot) -> bool {
    matches!(
        snapshot.phase,
        TracePhase::AwaitingSandbox | TracePhase::Running
    )
}

/// Sleep until `deadline`, or forever when there is none (so the select arm
/// never fires).
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn render_new_steps(
    snapshot: &TraceSnapshot,
    printed: &mut usize,
    thinking: &mut ThinkingTimer,
    now: Instant,
) {
    let steps = snapshot.steps();
    for step in &steps[(*printed).min(steps.len())..] {
        *printed += 1;
        thinking.on_step(now);
        println!();
        println!(
            "step {} ({:.1}s, {} in / {} out tokens)",
            *printed, step.duration, step.input_tokens, step.output_tokens
        );
        if let Some(thought) = &step.thought {
            println!("  thought: {}", thought);
        }
        for action in &step.actions {
            if action.description.is_empty() {
                println!("  action: {}", action.function_name);
            } else {
                println!("  action: {} ({})", action.function_name, action.description);
            }
        }
        if let Some(error) = &step.error {
            println!("  error: {}", error);
        }
    }
}
