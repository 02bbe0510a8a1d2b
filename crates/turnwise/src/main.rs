//! Replay a conversation transcript through the context engine and print
//! what would be sent to the model.
//!
//! # Examples
//!
//! ```sh
//! # Assembled messages for a transcript
//! turnwise session.json
//!
//! # Usage statistics with a small window and structured compression
//! turnwise session.json --max-tokens 8000 --structured --show stats
//!
//! # Pipe a transcript, mount a file, and dump the full export
//! cat session.json | turnwise --stdin --mount src/lib.rs --show export
//! ```
//!
//! A transcript is a JSON array of records:
//!
//! ```json
//! [
//!   {"role": "user", "content": "Fix the parser"},
//!   {"role": "tool_call", "tool": "read_file", "args": {"path": "src/parser.rs"}},
//!   {"role": "tool", "tool": "read_file", "content": "File: src/parser.rs\n..."},
//!   {"role": "assistant", "content": "Done."}
//! ]
//! ```

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnwise::prelude::*;

/// Replay a transcript through the context engine.
#[derive(Parser)]
#[command(name = "turnwise")]
struct Cli {
    // ── Input ──────────────────────────────────────────────────
    /// Transcript file (JSON array of records)
    transcript: Option<PathBuf>,

    /// Read the transcript from stdin
    #[arg(long)]
    stdin: bool,

    /// Mount a file into the stable prefix (repeatable)
    #[arg(long = "mount")]
    mounts: Vec<PathBuf>,

    // ── Configuration ──────────────────────────────────────────
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Active model
    #[arg(long)]
    model: Option<String>,

    /// Context mode: smart or cache
    #[arg(long)]
    mode: Option<ContextMode>,

    /// Compress history into structured state instead of text digests
    #[arg(long)]
    structured: bool,

    /// Number of recent turns kept verbatim
    #[arg(long)]
    window: Option<usize>,

    /// Override the active model's context window
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Emit cache-control hints on the stable prefix
    #[arg(long)]
    cache_hints: bool,

    // ── Output ─────────────────────────────────────────────────
    /// What to print
    #[arg(long, value_enum, default_value_t = Show::Messages)]
    show: Show,

    /// Log engine decisions to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Show {
    Messages,
    Stats,
    Export,
}

/// One transcript entry.
#[derive(Deserialize)]
struct Record {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    args: Option<serde_json::Value>,
}

// ── Helpers ────────────────────────────────────────────────────────

fn read_transcript(cli: &Cli) -> Result<Vec<Record>, String> {
    let raw = match (&cli.transcript, cli.stdin) {
        (_, true) => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            buf
        }
        (Some(path), false) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read transcript '{}': {e}", path.display()))?,
        (None, false) => return Err("provide a transcript path or --stdin".to_string()),
    };
    serde_json::from_str(&raw).map_err(|e| format!("failed to parse transcript: {e}"))
}

fn build_config(cli: &Cli) -> Result<ContextConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ContextConfig::from_json_file(path).map_err(|e| e.to_string())?,
        None => ContextConfig::default(),
    };
    if let Some(model) = &cli.model {
        config = config.with_model(model);
    }
    if let Some(mode) = cli.mode {
        config = config.with_mode(mode);
    }
    if cli.structured {
        config = config.with_structured_state(true);
    }
    if let Some(window) = cli.window {
        config = config.with_min_preserved_turns(window);
    }
    if let Some(max_tokens) = cli.max_tokens {
        let model = config.model.clone();
        config = config.with_model_limit(model, max_tokens);
    }
    if cli.cache_hints {
        config = config.with_cache_hints(true);
    }
    Ok(config)
}

fn replay(ctx: &mut ContextManager, records: Vec<Record>) -> Result<(), ContextError> {
    for (index, record) in records.into_iter().enumerate() {
        match record.role.as_str() {
            "user" => {
                if ctx.is_turn_active() {
                    ctx.complete_turn(None)?;
                }
                ctx.start_turn(record.content)?;
            }
            "assistant" => ctx.add_assistant_message(record.content)?,
            "tool_call" => ctx.add_tool_call(
                record.tool.unwrap_or_default(),
                record.args.unwrap_or_else(|| serde_json::json!({})),
            )?,
            "tool" => ctx.add_tool_response(record.tool.unwrap_or_default(), record.content)?,
            "system" => {
                ctx.add_system_message(record.content);
            }
            other => debug!(index, role = other, "skipping record with unknown role"),
        }
    }
    if ctx.is_turn_active() {
        ctx.complete_turn(None)?;
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<String, String> {
    let config = build_config(cli)?;
    let records = read_transcript(cli)?;

    let mut ctx = ContextManager::try_new(config).map_err(|e| e.to_string())?;
    for path in &cli.mounts {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read mount '{}': {e}", path.display()))?;
        ctx.mount_file(path, content);
    }

    info!("Replaying {} transcript records", records.len());
    replay(&mut ctx, records).map_err(|e| e.to_string())?;

    let output = match cli.show {
        Show::Messages => serde_json::to_string_pretty(&ctx.get_context_for_api()),
        Show::Stats => serde_json::to_string_pretty(&ctx.context_stats()),
        Show::Export => serde_json::to_string_pretty(&ctx.export_context()),
    };
    output.map_err(|e| format!("failed to serialize output: {e}"))
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();

    match run(&cli) {
        Ok(output) => println!("{output}"),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}
