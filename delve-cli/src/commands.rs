//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::{Context, anyhow, bail};
use chrono::Utc;
use delve_core::config::DelveConfig;
use delve_core::estimate::{CostEstimate, CostEstimator};
use delve_core::export::MarkdownExporter;
use delve_core::notify::DesktopNotifier;
use delve_core::orchestrator::{
    ProgressCallback, ProgressUpdate, ResearchOrchestrator, StartOptions, StatusReport,
};
use delve_core::remote::HttpResearchApi;
use delve_core::store::ResearchStore;
use delve_core::types::{ResultRecord, TaskStatus, short_id};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How long background units get to stop when the CLI exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How to print command output.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    fn json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    /// Progress chatter goes to stderr and is dropped in quiet or JSON mode.
    fn note(&self, message: impl AsRef<str>) {
        if !self.quiet && !self.json {
            eprintln!("{}", message.as_ref());
        }
    }
}

/// Prints each poll tick to stderr.
struct ConsoleProgress {
    output: Output,
}

impl ProgressCallback for ConsoleProgress {
    fn on_progress(&self, update: &ProgressUpdate) -> anyhow::Result<()> {
        let mut line = format!(
            "[{}] {:5.1}%  {} ({})",
            short_id(&update.task_id),
            update.progress,
            update.action,
            update.remote_status
        );
        if update.stall.is_hanging {
            line.push_str(&format!("  possible hang: {}", update.stall.reason));
        }
        self.output.note(line);
        Ok(())
    }
}

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: DelveConfig,
    workspace: &Path,
    output: Output,
) -> anyhow::Result<()> {
    match command {
        Commands::Config { action } => handle_config(action, &config, workspace),
        Commands::Estimate { query } => handle_estimate(&query, output),
        Commands::Start {
            query,
            model,
            no_notify,
            max_wait,
            detach,
        } => {
            let orchestrator = build_orchestrator(&config, true, output)?;
            let options = StartOptions {
                model,
                enable_notifications: no_notify.then_some(false),
                max_wait_secs: max_wait,
                callback: None,
            };
            handle_start(&orchestrator, &query, options, detach, output).await
        }
        Commands::Resume { detach } => {
            let orchestrator = build_orchestrator(&config, true, output)?;
            handle_resume(&orchestrator, detach, output).await
        }
        Commands::Status { task_id } => {
            let orchestrator = build_orchestrator(&config, false, output)?;
            let task_id = resolve_id(&orchestrator, &task_id).await?;
            let status = orchestrator.get_status(&task_id).await?;
            if output.json {
                output.json(&status)
            } else {
                print_status(&status);
                Ok(())
            }
        }
        Commands::Result {
            task_id,
            export,
            partial,
        } => {
            let orchestrator = build_orchestrator(&config, false, output)?;
            let task_id = resolve_id(&orchestrator, &task_id).await?;
            handle_result(&orchestrator, &config, &task_id, export, partial, output).await
        }
        Commands::Cancel {
            task_id,
            discard_partial,
        } => {
            let orchestrator = build_orchestrator(&config, false, output)?;
            let task_id = resolve_id(&orchestrator, &task_id).await?;
            let response = orchestrator.cancel(&task_id, !discard_partial).await?;
            if output.json {
                return output.json(&response);
            }
            println!(
                "Cancelled {} at {:.0}%{}",
                short_id(&response.task_id),
                response.progress_at_cancellation,
                if response.partial_saved {
                    "; partial output saved"
                } else {
                    ""
                }
            );
            Ok(())
        }
        Commands::List { status, limit } => {
            let orchestrator = build_orchestrator(&config, false, output)?;
            let status = status
                .as_deref()
                .map(|s| TaskStatus::parse(s).ok_or_else(|| anyhow!("Unknown status '{}'", s)))
                .transpose()?;
            let tasks = orchestrator.list_tasks(status, limit).await?;
            if output.json {
                return output.json(&tasks);
            }
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in tasks {
                println!(
                    "{}  {:<13} {:>5.1}%  {}  {}",
                    task.short_id(),
                    task.status.as_str(),
                    task.progress,
                    task.created_at.format("%Y-%m-%d %H:%M"),
                    truncate(&task.query, 50)
                );
            }
            Ok(())
        }
        Commands::Delete { task_id } => {
            let orchestrator = build_orchestrator(&config, false, output)?;
            let task_id = resolve_id(&orchestrator, &task_id).await?;
            if orchestrator.delete_task(&task_id).await? {
                println!("Deleted {}", short_id(&task_id));
            }
            Ok(())
        }
    }
}

/// Open the store and wire up the orchestrator.
///
/// The API key is only required by commands that talk to the remote service.
fn build_orchestrator(
    config: &DelveConfig,
    needs_remote: bool,
    output: Output,
) -> anyhow::Result<ResearchOrchestrator> {
    let path = config.store.resolved_path();
    let store = ResearchStore::open(&path, config.store.clone())
        .with_context(|| format!("Failed to open task database at {}", path.display()))?;

    let api_key = match config.remote.api_key() {
        Ok(key) => key,
        Err(e) if needs_remote => return Err(e.into()),
        Err(_) => String::new(),
    };
    let remote = HttpResearchApi::new(&config.remote, api_key)?;

    Ok(
        ResearchOrchestrator::builder(Arc::new(store), Arc::new(remote))
            .config(config.clone())
            .notifier(Arc::new(DesktopNotifier::new()))
            .callback(Arc::new(ConsoleProgress { output }))
            .build(),
    )
}

async fn handle_start(
    orchestrator: &ResearchOrchestrator,
    query: &str,
    options: StartOptions,
    detach: bool,
    output: Output,
) -> anyhow::Result<()> {
    let estimate = orchestrator.estimate(query);
    output.note(format!(
        "Estimated {} query: {:.0}-{:.0} min, ${:.2}-${:.2}",
        estimate.complexity,
        estimate.minutes.min,
        estimate.minutes.max,
        estimate.usd.min,
        estimate.usd.max
    ));

    let response = orchestrator.start_research(query, options).await?;
    let id = short_id(&response.task_id).to_string();

    if response.status != TaskStatus::RunningAsync {
        return report_outcome(orchestrator, &response.task_id, output).await;
    }

    if detach {
        orchestrator.shutdown(SHUTDOWN_GRACE).await;
        if output.json {
            return output.json(&response);
        }
        println!(
            "Task {id} is still running remotely. Run `delve resume` to keep polling it, \
             or `delve status {id}` to check on it."
        );
        return Ok(());
    }

    output.note(format!(
        "Task {id} is taking a while; polling in the background (Ctrl-C to stop)."
    ));
    if wait_for_tasks(orchestrator).await {
        report_outcome(orchestrator, &response.task_id, output).await
    } else {
        output.note(format!("Stopped. Run `delve resume` to continue task {id}."));
        Ok(())
    }
}

async fn handle_resume(
    orchestrator: &ResearchOrchestrator,
    detach: bool,
    output: Output,
) -> anyhow::Result<()> {
    let summary = orchestrator.resume_incomplete().await?;
    if summary.total() == 0 {
        output.note("No unfinished tasks.");
        return if output.json { output.json(&summary) } else { Ok(()) };
    }
    for id in &summary.failed {
        output.note(format!(
            "Task {} never reached the remote service; marked failed.",
            short_id(id)
        ));
    }
    output.note(format!("Re-attached {} task(s).", summary.resumed.len()));

    if detach {
        orchestrator.shutdown(SHUTDOWN_GRACE).await;
        return if output.json { output.json(&summary) } else { Ok(()) };
    }
    let finished = wait_for_tasks(orchestrator).await;

    let mut reports = Vec::new();
    for id in &summary.resumed {
        reports.push(orchestrator.get_status(id).await?);
    }
    if output.json {
        return output.json(&reports);
    }
    for status in &reports {
        println!(
            "{}  {:<13} {}",
            short_id(&status.task_id),
            status.status.as_str(),
            status.error_message.as_deref().unwrap_or("")
        );
    }
    if !finished {
        output.note("Stopped. Run `delve resume` to continue.");
    }
    Ok(())
}

async fn handle_result(
    orchestrator: &ResearchOrchestrator,
    config: &DelveConfig,
    task_id: &str,
    export: bool,
    partial: bool,
    output: Output,
) -> anyhow::Result<()> {
    let result = if partial {
        orchestrator
            .get_partial_result(task_id)
            .await?
            .ok_or_else(|| anyhow!("Task {} has no output yet", short_id(task_id)))?
    } else {
        orchestrator.get_result(task_id).await?
    };

    if export {
        let task = orchestrator
            .store()
            .get_task(task_id)
            .await?
            .ok_or_else(|| anyhow!("Task {} not found", short_id(task_id)))?;
        let exporter = MarkdownExporter::new(config.export.clone())?;
        let saved = exporter.export(&task, &result, Utc::now())?;
        output.note(format!("Saved report to {}", saved.path.display()));
    }

    if output.json {
        output.json(&result)
    } else {
        print_result(&result);
        Ok(())
    }
}

fn handle_estimate(query: &str, output: Output) -> anyhow::Result<()> {
    let estimate = CostEstimator::new().estimate(query);
    if output.json {
        return output.json(&estimate);
    }
    print_estimate(&estimate);
    Ok(())
}

fn handle_config(action: ConfigAction, config: &DelveConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".delve");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&DelveConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

/// Wait until every background unit has finished. Returns `false` if interrupted.
async fn wait_for_tasks(orchestrator: &ResearchOrchestrator) -> bool {
    loop {
        if orchestrator.running_tasks().is_empty() {
            return true;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                orchestrator.shutdown(SHUTDOWN_GRACE).await;
                return false;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

/// Print a finished task's report, or its status if it did not complete.
async fn report_outcome(
    orchestrator: &ResearchOrchestrator,
    task_id: &str,
    output: Output,
) -> anyhow::Result<()> {
    let status = orchestrator.get_status(task_id).await?;
    match status.status {
        TaskStatus::Completed => {
            let result = orchestrator.get_result(task_id).await?;
            if output.json {
                output.json(&result)
            } else {
                print_result(&result);
                Ok(())
            }
        }
        TaskStatus::Failed => {
            if output.json {
                output.json(&status)?;
            }
            bail!(
                "Task {} failed: {}",
                short_id(task_id),
                status.error_message.as_deref().unwrap_or("unknown error")
            )
        }
        _ => {
            if output.json {
                output.json(&status)
            } else {
                print_status(&status);
                Ok(())
            }
        }
    }
}

/// Accept a full task id or a unique prefix of one.
async fn resolve_id(orchestrator: &ResearchOrchestrator, prefix: &str) -> anyhow::Result<String> {
    if orchestrator.store().get_task(prefix).await?.is_some() {
        return Ok(prefix.to_string());
    }
    let matches: Vec<String> = orchestrator
        .list_tasks(None, 10_000)
        .await?
        .into_iter()
        .filter(|t| t.id.starts_with(prefix))
        .map(|t| t.id)
        .collect();
    match matches.as_slice() {
        [] => bail!("No task matches '{}'", prefix),
        [id] => Ok(id.clone()),
        _ => bail!("'{}' is ambiguous ({} tasks match)", prefix, matches.len()),
    }
}

fn print_status(status: &StatusReport) {
    println!("Task      {}", status.task_id);
    println!("Status    {}", status.status);
    println!(
        "Progress  {:.1}%  {}",
        status.progress,
        status.current_action.as_deref().unwrap_or("")
    );
    println!("Model     {}", status.model);
    println!("Elapsed   {:.1} min", status.elapsed_secs / 60.0);
    println!(
        "Tokens    {} in / {} out (${:.4})",
        status.tokens_in, status.tokens_out, status.cost_estimate
    );
    if let Some(remaining) = status.estimated_remaining_minutes {
        println!("Remaining ~{:.0} min", remaining);
    }
    if let Some(stall) = status.stall.as_ref().filter(|s| s.is_hanging) {
        println!(
            "Warning   {} ({:.0}% confidence). {}",
            stall.reason,
            stall.confidence * 100.0,
            stall.recommendation
        );
    }
    if let Some(error) = &status.error_message {
        println!("Error     {}", error);
    }
}

fn print_result(result: &ResultRecord) {
    if result.is_partial() {
        println!("(partial output)\n");
    }
    println!("{}", result.report);
    if !result.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in result.sources.iter().enumerate() {
            println!("  {}. {} - {}", i + 1, source.title, source.url);
        }
    }
}

fn print_estimate(estimate: &CostEstimate) {
    println!("Complexity  {} (score {})", estimate.complexity, estimate.score);
    println!(
        "Duration    {:.0}-{:.0} min (likely {:.0})",
        estimate.minutes.min, estimate.minutes.max, estimate.minutes.likely
    );
    println!(
        "Cost        ${:.2}-${:.2} (likely ${:.2})",
        estimate.usd.min, estimate.usd.max, estimate.usd.likely
    );
    if estimate.will_likely_go_async {
        println!("Mode        will likely continue in the background");
    }
    println!("\n{}", estimate.recommendation);
}

/// Shorten `s` to at most `max` characters for table output.
fn truncate(s: &str, max: usize) -> String {
    let s = s.trim().replace('\n', " ");
    if s.chars().count() <= max {
        return s;
    }
    let head: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}
