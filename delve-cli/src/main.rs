//! Delve CLI - start, watch, and collect long-running research tasks.
//!
//! Tasks that outlast the synchronous wait keep polling in this process until they
//! finish or the user presses Ctrl-C. Interrupted tasks are picked up again by
//! `delve resume`.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Delve: research tasks that survive timeouts and restarts
#[derive(Parser, Debug)]
#[command(name = "delve", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (for `.delve/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a research task
    Start {
        /// The research question
        query: String,
        /// Remote model to use
        #[arg(short, long)]
        model: Option<String>,
        /// Do not send a desktop notification when it finishes in the background
        #[arg(long)]
        no_notify: bool,
        /// Give up after this many seconds
        #[arg(long)]
        max_wait: Option<u64>,
        /// Return once the task moves to the background instead of waiting for it
        #[arg(short, long)]
        detach: bool,
    },
    /// Show the status of a task
    Status {
        /// Task id (or a unique prefix)
        task_id: String,
    },
    /// Print the result of a completed task
    Result {
        /// Task id (or a unique prefix)
        task_id: String,
        /// Also save the report as Markdown
        #[arg(short, long)]
        export: bool,
        /// Show partial output of an unfinished task
        #[arg(long)]
        partial: bool,
    },
    /// Cancel a running task
    Cancel {
        /// Task id (or a unique prefix)
        task_id: String,
        /// Drop any output produced so far
        #[arg(long)]
        discard_partial: bool,
    },
    /// List recent tasks
    List {
        /// Only show tasks in this state (e.g. running_async, completed)
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete a task with its result and history
    Delete {
        /// Task id (or a unique prefix)
        task_id: String,
    },
    /// Estimate duration and cost of a query without running it
    Estimate {
        /// The research question
        query: String,
    },
    /// Re-attach tasks left running by an earlier process and wait for them
    Resume {
        /// Re-attach and return without waiting
        #[arg(short, long)]
        detach: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default configuration file to the workspace
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "delve", "delve")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "delve.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = delve_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let output = commands::Output {
        json: cli.json,
        quiet: cli.quiet,
    };
    commands::handle_command(cli.command, config, &workspace, output).await
}
