//! Overseer - watchdog for agent-driven terminal sessions
//!
//! Command-line front end over the monitor: manage scopes, run checks once
//! or continuously, and inspect or roll back configuration versions.

use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use overseer::optimizer::OptimizationStatus;
use overseer::{
    Monitor, MonitorSettings, MonitoredScope, OptimizationRecord, OverseerError, Result,
    ScopeStatus,
};

#[derive(Parser)]
#[command(name = "overseer")]
#[command(version)]
#[command(about = "Stall detection, config optimization and rollback for agent sessions", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory holding the .overseer data directory
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Owner whose sessions are monitored (defaults to settings.defaultOwner)
    #[arg(long, global = true, env = "OVERSEER_OWNER")]
    owner: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage monitored scopes
    Scope {
        #[command(subcommand)]
        action: ScopeAction,
    },

    /// Check a scope for stalled sessions once
    Check {
        /// Scope id
        scope: String,

        /// React to findings: record events, roll back, start optimizations
        #[arg(long)]
        act: bool,
    },

    /// Monitor scopes until interrupted
    Watch {
        /// Scope ids (all idle scopes of the owner when omitted)
        scopes: Vec<String>,
    },

    /// Show the configuration version history of a session
    Versions {
        /// Session id
        session: String,
    },

    /// Show per-version performance next to optimizer scores
    Correlation {
        /// Session id
        session: String,
    },

    /// Roll a session back to its previous configuration version
    Rollback {
        /// Session id
        session: String,

        /// Reason recorded on the rolled back version
        #[arg(short, long, default_value = "manual rollback")]
        reason: String,
    },

    /// Show optimization attempts, newest first
    History {
        /// Only attempts for this session
        #[arg(long)]
        session: Option<String>,

        /// Only attempts started by this scope
        #[arg(long)]
        scope: Option<String>,

        /// Maximum number of attempts
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Capture the terminal of a stalled session
    Diagnose {
        /// Session id
        session: String,
    },

    /// Optimize a session now, ignoring the cooldown
    Optimize {
        /// Session id
        session: String,
    },
}

#[derive(Subcommand)]
enum ScopeAction {
    /// Create a scope
    Add {
        /// Folder to monitor (all sessions of the owner when omitted)
        #[arg(long)]
        folder: Option<String>,

        /// Seconds without activity before a session counts as stalled
        #[arg(long)]
        threshold: Option<u64>,

        /// Seconds between checks (at least 30)
        #[arg(long)]
        tick: Option<u64>,
    },

    /// List scopes
    List,

    /// Pause a scope
    Pause { scope: String },

    /// Resume a paused scope
    Resume { scope: String },

    /// Delete a scope
    Remove { scope: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "overseer=debug,info"
    } else {
        "overseer=info,warn"
    };

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        return Err(OverseerError::settings_with_path(
            "Project directory does not exist",
            project_path,
        ));
    }

    let settings = MonitorSettings::load_validated(&project_path)?;
    let owner = cli.owner.clone().or_else(|| settings.default_owner.clone());
    let monitor = Monitor::open(&project_path, &settings);
    let json = cli.json;

    match cli.command {
        Commands::Scope { action } => scope_command(&monitor, action, owner.as_deref(), json),

        Commands::Check { scope, act } => {
            if act {
                monitor.refresh_analyses(&scope).await?;
                let report = monitor.run_check_cycle(&scope).await?;
                monitor.wait_for_optimizations().await;
                if json {
                    return print_json(&report);
                }
                print_stalled(report.check.as_ref().map(|c| c.stalled_sessions.as_slice()));
                for session in &report.rolled_back {
                    println!("{} Rolled back {}", "OK".green().bold(), session);
                }
                for record in &report.triggered {
                    let latest = monitor.coordinator().get(&record.id);
                    print_record(latest.as_ref().unwrap_or(record));
                }
                println!("{}", report.summary().dimmed());
            } else {
                let result = monitor.check_for_stalled_sessions(&scope).await?;
                if json {
                    return print_json(&result);
                }
                println!(
                    "\n{} {} of {} session(s) stalled",
                    "Check:".cyan().bold(),
                    result.stalled_sessions.len(),
                    result.checked_sessions
                );
                print_stalled(Some(&result.stalled_sessions));
            }
            Ok(())
        }

        Commands::Watch { scopes } => watch(&monitor, scopes, owner.as_deref()).await,

        Commands::Versions { session } => {
            let history = monitor.get_config_version_history(&session);
            if json {
                return print_json(&history);
            }
            if history.is_empty() {
                println!("No configuration versions for {}", session);
                return Ok(());
            }
            println!("\n{} {}", "Versions:".cyan().bold(), session);
            println!("{}", "─".repeat(40));
            for snapshot in &history {
                let line = format!("   {}", snapshot.summary());
                if snapshot.rolled_back {
                    println!("{}", line.dimmed());
                } else {
                    println!("{}", line);
                }
            }
            Ok(())
        }

        Commands::Correlation { session } => {
            let rows = monitor.get_performance_correlation(&session);
            if json {
                return print_json(&rows);
            }
            println!("\n{} {}", "Performance:".cyan().bold(), session);
            println!("{}", "─".repeat(40));
            for row in &rows {
                let score = row
                    .score
                    .map_or_else(|| "-".to_string(), |s| format!("{:.2}", s));
                let marker = if row.active { "*" } else { " " };
                let line = format!(
                    " {} v{} score={} stalls={} errors={} successes={}",
                    marker, row.version, score, row.stall_count, row.error_count, row.success_count
                );
                if row.degraded {
                    println!("{} {}", line, "[degraded]".red());
                } else {
                    println!("{}", line);
                }
            }
            Ok(())
        }

        Commands::Rollback { session, reason } => {
            let outcome = monitor.rollback_config(&session, &reason);
            if json {
                return print_json(&outcome);
            }
            match (outcome.success, outcome.rolled_back_to, outcome.error) {
                (true, Some(version), _) => {
                    println!("{} {} now at v{}", "OK".green().bold(), session, version);
                    Ok(())
                }
                (_, _, error) => {
                    let reason = error.unwrap_or_else(|| "rollback failed".to_string());
                    Err(OverseerError::Other(anyhow::anyhow!(reason)))
                }
            }
        }

        Commands::History {
            session,
            scope,
            limit,
        } => {
            let records =
                monitor.get_optimization_history(session.as_deref(), scope.as_deref(), limit);
            if json {
                return print_json(&records);
            }
            if records.is_empty() {
                println!("No optimization attempts recorded");
            }
            for record in &records {
                print_record(record);
            }
            Ok(())
        }

        Commands::Diagnose { session } => {
            let diagnosis = monitor.diagnose(&session).await?;
            if json {
                return print_json(&diagnosis);
            }
            match diagnosis {
                None => println!(
                    "{} {} is active, nothing to capture",
                    "OK".green().bold(),
                    session
                ),
                Some(diagnosis) => {
                    println!(
                        "\n{} {} ({})",
                        "Stalled:".yellow().bold(),
                        session,
                        diagnosis.reason
                    );
                    println!("{}", "─".repeat(40));
                    match diagnosis.text {
                        Some(text) => println!("{}", text),
                        None => println!("{}", "(terminal not available)".dimmed()),
                    }
                }
            }
            Ok(())
        }

        Commands::Optimize { session } => {
            let Some(record) = monitor.trigger_optimization(&session).await? else {
                return Err(OverseerError::optimizer(format!(
                    "session {} runs no agent",
                    session
                )));
            };
            monitor.wait_for_optimizations().await;
            let record = monitor.coordinator().get(&record.id).unwrap_or(record);
            if json {
                return print_json(&record);
            }
            print_record(&record);
            Ok(())
        }
    }
}

fn scope_command(
    monitor: &Monitor,
    action: ScopeAction,
    owner: Option<&str>,
    json: bool,
) -> Result<()> {
    match action {
        ScopeAction::Add {
            folder,
            threshold,
            tick,
        } => {
            let owner = require_owner(owner)?;
            let mut scope = match folder {
                Some(folder) => MonitoredScope::folder(owner, folder),
                None => MonitoredScope::master(owner),
            };
            scope.stall_threshold_seconds = threshold;
            scope.tick_interval_seconds = tick;

            let scope = monitor.create_scope(scope)?;
            if json {
                return print_json(&scope);
            }
            println!("{} Created scope {}", "OK".green().bold(), scope.summary());
        }

        ScopeAction::List => {
            let scopes = monitor.list_scopes(owner)?;
            if json {
                return print_json(&scopes);
            }
            if scopes.is_empty() {
                println!("No scopes configured");
            }
            for scope in &scopes {
                let line = format!("   {}", scope.summary());
                if scope.status == ScopeStatus::Paused {
                    println!("{}", line.dimmed());
                } else {
                    println!("{}", line);
                }
            }
        }

        ScopeAction::Pause { scope } => {
            let scope = monitor.pause_scope(&scope)?;
            if json {
                return print_json(&scope);
            }
            println!("{} Paused {}", "OK".green().bold(), scope.id);
        }

        ScopeAction::Resume { scope } => {
            let scope = monitor.resume_scope(&scope)?;
            if json {
                return print_json(&scope);
            }
            println!("{} Resumed {}", "OK".green().bold(), scope.id);
        }

        ScopeAction::Remove { scope } => {
            if !monitor.delete_scope(&scope)? {
                return Err(OverseerError::scope_not_found(scope));
            }
            if json {
                return print_json(&serde_json::json!({ "deleted": scope }));
            }
            println!("{} Removed {}", "OK".green().bold(), scope);
        }
    }
    Ok(())
}

async fn watch(monitor: &Arc<Monitor>, scopes: Vec<String>, owner: Option<&str>) -> Result<()> {
    let scope_ids = if scopes.is_empty() {
        monitor
            .list_scopes(owner)?
            .into_iter()
            .filter(|s| !s.is_paused())
            .map(|s| s.id)
            .collect()
    } else {
        scopes
    };

    if scope_ids.is_empty() {
        return Err(OverseerError::scope_not_found("(no active scopes)"));
    }

    for id in &scope_ids {
        monitor.start_monitoring(id)?;
        println!("{} Watching scope {}", "OK".green().bold(), id);
    }
    println!("{}", "Press Ctrl-C to stop".dimmed());

    tokio::signal::ctrl_c().await?;

    monitor.shutdown();
    println!("\n{} Waiting for running optimizations...", "Stopping:".yellow().bold());
    monitor.wait_for_optimizations().await;
    Ok(())
}

fn require_owner(owner: Option<&str>) -> Result<&str> {
    owner.ok_or_else(|| OverseerError::InvalidSettings {
        reason: "no owner given (use --owner or set defaultOwner)".to_string(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stalled(stalled: Option<&[overseer::StalledSession]>) {
    for entry in stalled.unwrap_or_default() {
        println!(
            "   {} {} ({})",
            "!".yellow().bold(),
            entry.session.label(),
            entry.reason
        );
    }
}

fn print_record(record: &OptimizationRecord) {
    let status = match record.status {
        OptimizationStatus::Completed if record.config_applied => "applied".green().bold(),
        OptimizationStatus::Completed => "completed".green(),
        OptimizationStatus::Failed => "failed".red().bold(),
        OptimizationStatus::Running => "running".yellow(),
        OptimizationStatus::Pending => "pending".dimmed(),
    };
    println!("   [{}] {}", status, record.summary());
}
