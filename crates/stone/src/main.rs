//! CLI for the stone issue workflow.
//!
//! Run `stone --help` for usage information.

// CLI binaries legitimately need println! for user output
#![allow(clippy::disallowed_macros)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use notify::Notifier;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stone::feedback::FeedbackProcessor;
use stone::handlers::{enabled_stages_from_config, standard_handlers, PromptLibrary};
use stone::recovery::ErrorStateStore;
use stone::{
    ClaudeClient, ConflictManager, ErrorRecovery, FileErrorStore, GitHubClient, GitRunner,
    HandlerContext, IssueTracker, LabelSet, Orchestrator, WorkflowError,
};
use stone_config::{StoneConfig, DEFAULT_CONFIG_FILE};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stone")]
#[command(about = "Label-driven GitHub issue workflow with graduated error recovery")]
#[command(version)]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, env = "STONE_CONFIG", default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Output format: json, text
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format: json, text
    #[arg(long, default_value = "text", global = true)]
    log_format: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the active stage of one or more issues
    Run {
        /// Issue number; repeat for several issues
        #[arg(short, long = "issue", required = true)]
        issues: Vec<u64>,

        /// Directory with `{stage}.hbs` prompt overrides
        #[arg(long)]
        prompts: Option<PathBuf>,

        /// Skip conflict handling in the PR stage
        #[arg(long)]
        no_conflicts: bool,

        /// Git remote of the local clone
        #[arg(long, default_value = "origin")]
        remote: String,
    },

    /// Print the stage a label set resolves to
    Stage {
        /// Comma-separated labels
        #[arg(short, long, value_delimiter = ',')]
        labels: Vec<String>,
    },

    /// Inspect and manage persisted error states
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },

    /// Detect, resolve or report merge conflicts on a branch
    Conflicts {
        #[command(subcommand)]
        action: ConflictAction,

        /// Git remote to compare against; local branches when omitted
        #[arg(long, global = true)]
        remote: Option<String>,
    },

    /// Triage review comments on a pull request into tracking issues
    Feedback {
        /// Pull request number
        #[arg(short, long)]
        pr: u64,

        /// Classify and route without opening issues
        #[arg(short, long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum RecoveryAction {
    /// List every error state
    List,
    /// Show one error state
    Show { workflow_id: String },
    /// Delete an error state after a manual fix
    Clear { workflow_id: String },
    /// Climb one rung of the recovery ladder
    Attempt { workflow_id: String },
}

#[derive(Subcommand)]
enum ConflictAction {
    /// Simulate the merge without touching the working tree
    Detect {
        #[arg(short, long)]
        branch: String,
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Rebase, merge or keep ours per file
    Resolve {
        #[arg(short, long)]
        branch: String,
        #[arg(short, long)]
        target: Option<String>,
    },
    /// Branch, PR and conflict report
    Status {
        #[arg(short, long)]
        branch: String,
        #[arg(short, long)]
        target: Option<String>,
        /// Post the report on this issue
        #[arg(long)]
        comment_on: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Stage { labels } => {
            let set: LabelSet = labels.iter().map(|l| l.trim().to_string()).collect();
            let stage = set.active_stage();
            if cli.format == OutputFormat::Json {
                print_json(&serde_json::json!({
                    "stage": stage,
                    "label": stage.map(stone::Stage::label),
                }))?;
            } else {
                match stage {
                    Some(stage) => println!("{} ({})", stage.label().green(), stage),
                    None => println!("{}", "no active stage".yellow()),
                }
            }
            Ok(())
        }
        Commands::Run {
            issues,
            prompts,
            no_conflicts,
            remote,
        } => {
            let config = load_config(&cli.config)?;
            run_issues(&config, &issues, prompts.as_deref(), no_conflicts, &remote, cli.format).await
        }
        Commands::Recovery { action } => {
            let config = load_config(&cli.config)?;
            recovery_command(&config, action, cli.format).await
        }
        Commands::Conflicts { action, remote } => {
            let config = load_config(&cli.config)?;
            conflicts_command(&config, action, remote, cli.format).await
        }
        Commands::Feedback { pr, dry_run } => {
            let config = load_config(&cli.config)?;
            let tracker = github_client(&config)?;
            let report = FeedbackProcessor::new(tracker, &config.feedback)
                .with_timeout(config.workflow.timeout())
                .process_pull_request(pr, dry_run)
                .await
                .with_context(|| format!("Failed to triage feedback on PR #{pr}"))?;

            if cli.format == OutputFormat::Json {
                print_json(&report)?;
            } else if report.entries.is_empty() {
                println!("No actionable feedback in {} comment(s) on PR #{pr}", report.comments_seen);
            } else {
                println!(
                    "PR #{pr}: {} actionable of {} comment(s)\n",
                    report.entries.len(),
                    report.comments_seen
                );
                for entry in &report.entries {
                    let issue = entry
                        .issue_number
                        .map_or_else(|| "(dry run)".dimmed().to_string(), |n| format!("#{n}"));
                    println!(
                        "  [{}] {:<12} {:<10} @{} {}",
                        entry.priority.to_string().bold(),
                        entry.item.affected_area.to_string(),
                        entry.team,
                        entry.item.author,
                        issue
                    );
                }
            }
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, format: OutputFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("stone=debug,notify=debug")
        } else {
            EnvFilter::new("stone=info,notify=info")
        }
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        OutputFormat::Json => registry.with(fmt::layer().json().with_target(true)).init(),
        OutputFormat::Text => registry.with(fmt::layer().with_target(false)).init(),
    }
}

fn load_config(path: &Path) -> Result<StoneConfig> {
    let config = StoneConfig::load_or_default(path)
        .with_context(|| format!("Failed to load {}", path.display()))?
        .apply_env_overrides();
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn github_client(config: &StoneConfig) -> Result<Arc<dyn IssueTracker>> {
    let client = GitHubClient::from_config(&config.github).context("Failed to create GitHub client")?;
    Ok(Arc::new(client))
}

fn error_recovery(config: &StoneConfig, tracker: Arc<dyn IssueTracker>, notifier: Arc<Notifier>) -> ErrorRecovery {
    ErrorRecovery::new(
        Arc::new(FileErrorStore::new(&config.recovery.state_dir)),
        tracker,
        notifier,
    )
    .with_escalate_label(config.recovery.escalate_label.clone())
    .with_timeout(config.workflow.timeout())
}

fn conflict_manager(config: &StoneConfig, remote: Option<String>) -> ConflictManager {
    let git = GitRunner::new(&config.conflicts.repo_path).with_timeout(config.workflow.timeout());
    let manager = ConflictManager::new(git).with_api_timeout(config.workflow.timeout());
    match remote {
        Some(remote) => manager.with_remote(remote),
        None => manager,
    }
}

async fn run_issues(
    config: &StoneConfig,
    issues: &[u64],
    prompts: Option<&Path>,
    no_conflicts: bool,
    remote: &str,
    format: OutputFormat,
) -> Result<()> {
    let tracker = github_client(config)?;
    let llm = Arc::new(ClaudeClient::from_config(&config.claude).context("Failed to create Claude client")?);
    let notifier = Arc::new(Notifier::from_env());
    let recovery = Arc::new(error_recovery(config, Arc::clone(&tracker), Arc::clone(&notifier)));

    let mut ctx = HandlerContext::new(
        Arc::clone(&tracker),
        llm,
        Arc::clone(&notifier),
        Arc::clone(&recovery),
        config.workflow.clone(),
    )?;
    if let Some(dir) = prompts {
        ctx = ctx.with_prompts(PromptLibrary::with_overrides(dir)?);
    }
    if !no_conflicts {
        ctx = ctx.with_conflicts(
            conflict_manager(config, Some(remote.to_string())),
            config.conflicts.target_branch.clone(),
        );
    }

    let enabled = enabled_stages_from_config(&config.workflow)?;
    let handlers = standard_handlers(&Arc::new(ctx)).build(&enabled)?;
    let orchestrator = Arc::new(Orchestrator::new(
        tracker,
        handlers,
        recovery,
        notifier,
        config.workflow.clone(),
    ));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling in-flight runs");
            on_signal.cancel();
        }
    });

    info!(issues = ?issues, "Starting workflow runs");
    let results = orchestrator.run_batch(issues, &cancel).await;

    #[derive(Serialize)]
    struct RunReport {
        issue: u64,
        stage: Option<stone::Stage>,
        error: Option<String>,
    }

    let mut failed = 0;
    let mut report = Vec::with_capacity(results.len());
    for (issue, result) in results {
        let (stage, error) = match result {
            Ok(stage) => (stage, None),
            Err(WorkflowError::NoActiveStage { .. }) => (None, Some("no active stage".to_string())),
            Err(e) => {
                failed += 1;
                (None, Some(stone::error::error_chain(&e)))
            }
        };
        report.push(RunReport { issue, stage, error });
    }

    if format == OutputFormat::Json {
        print_json(&report)?;
    } else {
        for entry in &report {
            match (&entry.stage, &entry.error) {
                (Some(stage), _) => println!("{} #{} → {}", "✅".green(), entry.issue, stage.label()),
                (None, None) => println!("{} #{} → complete", "✅".green(), entry.issue),
                (None, Some(e)) if e == "no active stage" => {
                    println!("{} #{} skipped: {e}", "⏭".yellow(), entry.issue);
                }
                (None, Some(e)) => println!("{} #{} failed: {e}", "❌".red(), entry.issue),
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} issue(s) failed", report.len());
    }
    Ok(())
}

async fn recovery_command(config: &StoneConfig, action: RecoveryAction, format: OutputFormat) -> Result<()> {
    let store = FileErrorStore::new(&config.recovery.state_dir);

    match action {
        RecoveryAction::List => {
            let states = store.list().await?;
            if format == OutputFormat::Json {
                return print_json(&states);
            }
            if states.is_empty() {
                println!("No error states in {}", store.dir().display());
            }
            for state in &states {
                println!(
                    "{} #{} {} attempts={} {}",
                    state.workflow_id.bold(),
                    state.context.issue_number,
                    state.context.current_step,
                    state.recovery_attempts,
                    state.timestamp.to_rfc3339().dimmed()
                );
            }
        }
        RecoveryAction::Show { workflow_id } => {
            let state = store
                .load(&workflow_id)
                .await?
                .with_context(|| format!("No error state for {workflow_id}"))?;
            print_json(&state)?;
        }
        RecoveryAction::Clear { workflow_id } => {
            if store.delete(&workflow_id).await? {
                println!("{} Cleared {workflow_id}", "✅".green());
            } else {
                println!("{} No error state for {workflow_id}", "⚠️".yellow());
            }
        }
        RecoveryAction::Attempt { workflow_id } => {
            let recovery = error_recovery(config, github_client(config)?, Arc::new(Notifier::from_env()));
            let result = recovery.attempt_recovery(&workflow_id).await?;
            if format == OutputFormat::Json {
                return print_json(&result);
            }
            let marker = if result.success { "🔁".green() } else { "🚨".red() };
            println!(
                "{marker} {} (attempt {}): {}",
                result.recovery_strategy, result.attempts, result.message
            );
        }
    }
    Ok(())
}

async fn conflicts_command(
    config: &StoneConfig,
    action: ConflictAction,
    remote: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let manager = conflict_manager(config, remote);
    let default_target = config.conflicts.target_branch.as_str();

    match action {
        ConflictAction::Detect { branch, target } => {
            let target = target.as_deref().unwrap_or(default_target);
            manager.fetch().await.context("Failed to fetch remote")?;
            let result = manager.detect_conflicts(&branch, target).await?;
            if format == OutputFormat::Json {
                return print_json(&result);
            }
            if result.has_conflicts {
                println!("{} {branch} conflicts with {target}:", "❌".red());
                for file in &result.conflicting_files {
                    println!("  {file}");
                }
            } else {
                println!("{} {branch} merges cleanly into {target}", "✅".green());
            }
        }
        ConflictAction::Resolve { branch, target } => {
            let target = target.as_deref().unwrap_or(default_target);
            let result = manager.resolve_conflicts(&branch, target).await?;
            if format == OutputFormat::Json {
                print_json(&result)?;
            } else if result.success {
                let strategy = result.strategy.map(|s| s.to_string()).unwrap_or_default();
                println!("{} resolved via {strategy}", "✅".green());
                if result.needs_review {
                    println!("{} review these files:", "⚠️".yellow());
                    for file in &result.resolved_files {
                        println!("  {file}");
                    }
                }
            } else {
                println!(
                    "{} {}",
                    "❌".red(),
                    result.error.as_deref().unwrap_or("resolution failed")
                );
            }
            if !result.success {
                bail!("Could not resolve conflicts between {branch} and {target}");
            }
        }
        ConflictAction::Status {
            branch,
            target,
            comment_on,
        } => {
            let target = target.as_deref().unwrap_or(default_target);
            let tracker = github_client(config)?;
            manager.fetch().await.context("Failed to fetch remote")?;
            let status = manager.track_merge_status(&branch, target, tracker.as_ref()).await?;
            if let Some(issue) = comment_on {
                tracker
                    .create_comment(issue, &status.to_comment())
                    .await
                    .with_context(|| format!("Failed to comment on #{issue}"))?;
            }
            if format == OutputFormat::Json {
                print_json(&status)?;
            } else {
                print!("{}", status.to_comment());
            }
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
