//! The `taskplane` binary: a thin JSON front door over the intent dispatcher.
//!
//! One-shot mode runs a single intent and prints its envelope; serve mode
//! reads line-delimited JSON requests from stdin and answers one envelope per
//! line, for embedding under MCP-style hosts.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use taskplane::Dispatcher;
use taskplane::core::namespace::resolve_tasks_dir;

#[derive(Parser, Debug)]
#[clap(
    name = "taskplane",
    version = env!("CARGO_PKG_VERSION"),
    about = "Agent-first task control plane: contracts, checkpoints, evidence"
)]
struct Cli {
    /// Tasks root override (else APPLY_TASK_TASKS_DIR, else ~/.tasks/<namespace>).
    #[clap(long, global = true)]
    tasks_dir: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one JSON intent (inline argument, or stdin when omitted).
    Intent {
        /// The request object, e.g. '{"intent":"context","include_all":true}'.
        request: Option<String>,
    },
    /// Serve line-delimited JSON requests over stdin/stdout.
    Serve,
}

fn build_dispatcher(tasks_dir: Option<&PathBuf>) -> Result<Dispatcher> {
    let project_root = std::env::current_dir().context("cannot resolve working directory")?;
    let root = resolve_tasks_dir(tasks_dir.map(|p| p.as_path()), &project_root);
    Dispatcher::with_project_root(&root, &project_root)
        .with_context(|| format!("cannot open tasks root {}", root.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let dispatcher = build_dispatcher(cli.tasks_dir.as_ref())?;

    match cli.command {
        Command::Intent { request } => {
            let raw = match request {
                Some(raw) => raw,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .lock()
                        .read_line(&mut buffer)
                        .context("cannot read request from stdin")?;
                    buffer
                }
            };
            let value: Value = match serde_json::from_str(raw.trim()) {
                Ok(value) => value,
                Err(err) => serde_json::json!({"intent": "", "_parse_error": err.to_string()}),
            };
            let resp = dispatcher.process_intent(&value);
            println!("{}", resp.to_json());
            if !resp.success {
                std::process::exit(1);
            }
        }
        Command::Serve => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            for line in stdin.lock().lines() {
                let line = line.context("cannot read request line")?;
                if line.trim().is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(err) => serde_json::json!({"intent": "", "_parse_error": err.to_string()}),
                };
                let resp = dispatcher.process_intent(&value);
                let mut out = stdout.lock();
                writeln!(out, "{}", resp.to_json()).context("cannot write response")?;
                out.flush().ok();
            }
        }
    }
    Ok(())
}
