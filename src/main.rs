use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use nightshift::config::Config;
use nightshift::error::DaemonError;
use nightshift::logging::{CLI_FILTER, init_tracing};
use nightshift::service::health::RestartEvent;
use nightshift::service::supervisor::{DaemonOptions, run_daemon};
use nightshift::service::watchdog::run_watchdog;

mod commands;

#[derive(Parser)]
#[command(name = "nightshift")]
#[command(about = "Capacity-aware scheduler for multi-stage agent workflows")]
#[command(version)]
struct Cli {
    /// Path to the project directory (default: .nightshift in current dir)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Output as JSON for machine consumption
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new project: config, default workflow, starter agents
    Init,

    /// Add a new task
    Add {
        /// What the task should accomplish
        description: String,

        /// Workflow to run (default: workflow.default_workflow)
        #[arg(long)]
        workflow: Option<String>,

        /// low, normal, high or urgent
        #[arg(long)]
        priority: Option<String>,

        /// manual, supervised or autonomous
        #[arg(long)]
        autonomy: Option<String>,

        /// Task ID (generated from the description if not provided)
        #[arg(long)]
        id: Option<String>,

        /// Keep the task pending instead of queueing it
        #[arg(long)]
        hold: bool,
    },

    /// Queue a pending task
    Queue {
        id: String,
    },

    /// List tasks
    List {
        /// Only show tasks in this status (e.g. queued, in-progress, paused)
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one task in detail
    Show {
        id: String,
    },

    /// Pause a task
    Pause {
        id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Resume a paused task
    Resume {
        id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Cancel a task
    Cancel {
        id: String,

        #[arg(long)]
        reason: Option<String>,
    },

    /// Approve the stage a task is waiting on
    Approve {
        id: String,

        /// Who is approving
        #[arg(long)]
        actor: Option<String>,
    },

    /// Reject a task waiting for approval (cancels it)
    Reject {
        id: String,

        /// Who is rejecting
        #[arg(long)]
        actor: Option<String>,

        /// Reason for rejection
        #[arg(long)]
        reason: Option<String>,
    },

    /// Create a new attempt of a completed, failed or cancelled task
    Retry {
        id: String,
    },

    /// Show today's usage against the current window's threshold
    Capacity,

    /// Workflow definitions
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Validate one workflow, or all of them
    Check {
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon in the background
    Start {
        /// Run the daemon without a watchdog
        #[arg(long)]
        no_watchdog: bool,

        /// Poll interval in seconds (overrides config.toml)
        #[arg(long)]
        interval: Option<u64>,

        /// Maximum concurrently running tasks (overrides config.toml)
        #[arg(long)]
        max_concurrent: Option<usize>,
    },

    /// Stop the daemon and its watchdog
    Stop {
        /// SIGKILL immediately and clear a corrupted PID file
        #[arg(long)]
        force: bool,
    },

    /// Stop and start again
    Restart,

    /// Show whether the daemon is running
    Status,

    /// Show the daemon's health record
    Health,

    /// Run the daemon in the foreground (used by start and the watchdog)
    #[command(hide = true)]
    Run {
        #[command(flatten)]
        args: InternalArgs,
    },

    /// Run the watchdog in the foreground (used by start)
    #[command(hide = true)]
    Watchdog {
        #[command(flatten)]
        args: InternalArgs,
    },
}

#[derive(clap::Args)]
struct InternalArgs {
    #[arg(long)]
    interval: Option<u64>,

    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Why this process replaces a previous daemon
    #[arg(long)]
    restart_reason: Option<String>,

    #[arg(long)]
    restart_exit_code: Option<i32>,

    #[arg(long)]
    watchdog_restart: bool,
}

impl InternalArgs {
    fn into_options(self) -> DaemonOptions {
        let restart = self.restart_reason.map(|reason| RestartEvent {
            timestamp: Utc::now(),
            reason,
            exit_code: self.restart_exit_code,
            triggered_by_watchdog: self.watchdog_restart,
        });
        DaemonOptions {
            interval: self.interval,
            max_concurrent: self.max_concurrent,
            restart,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let dir = cli.dir.clone().unwrap_or_else(|| PathBuf::from(".nightshift"));
    let json = cli.json;

    init_logging(&dir, &cli.command);

    if let Err(e) = dispatch(&dir, cli.command, json) {
        report_error(&e, json);
        std::process::exit(1);
    }
}

/// Long-running processes log at the configured level; one-shot commands
/// only surface warnings
fn init_logging(dir: &Path, command: &Commands) {
    let long_running = matches!(
        command,
        Commands::Daemon {
            command: DaemonCommands::Run { .. } | DaemonCommands::Watchdog { .. }
        }
    );
    if long_running {
        let config = Config::load(dir).unwrap_or_default();
        init_tracing(&config.daemon.log_level, config.daemon.log_json);
    } else {
        init_tracing(CLI_FILTER, false);
    }
}

fn dispatch(dir: &Path, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Init => commands::init::run(dir, json),
        Commands::Add {
            description,
            workflow,
            priority,
            autonomy,
            id,
            hold,
        } => commands::add::run(
            dir,
            &description,
            commands::add::AddOptions {
                workflow: workflow.as_deref(),
                priority: priority.as_deref(),
                autonomy: autonomy.as_deref(),
                id: id.as_deref(),
                hold,
            },
            json,
        ),
        Commands::Queue { id } => commands::queue::run(dir, &id, json),
        Commands::List { status } => commands::list::run(dir, status.as_deref(), json),
        Commands::Show { id } => commands::show::run(dir, &id, json),
        Commands::Pause { id, reason } => commands::pause::run(dir, &id, reason.as_deref(), json),
        Commands::Resume { id, reason } => commands::resume::run(dir, &id, reason.as_deref(), json),
        Commands::Cancel { id, reason } => commands::cancel::run(dir, &id, reason.as_deref(), json),
        Commands::Approve { id, actor } => commands::approve::run(dir, &id, actor.as_deref(), json),
        Commands::Reject { id, actor, reason } => {
            commands::reject::run(dir, &id, reason.as_deref(), actor.as_deref(), json)
        }
        Commands::Retry { id } => commands::retry::run(dir, &id, json),
        Commands::Capacity => commands::capacity::run(dir, json),
        Commands::Workflow { command } => match command {
            WorkflowCommands::Check { name } => {
                commands::workflow::run_check(dir, name.as_deref(), json)
            }
        },
        Commands::Daemon { command } => match command {
            DaemonCommands::Start {
                no_watchdog,
                interval,
                max_concurrent,
            } => commands::daemon::run_start(
                dir,
                commands::daemon::StartOptions {
                    no_watchdog,
                    interval,
                    max_concurrent,
                },
                json,
            ),
            DaemonCommands::Stop { force } => commands::daemon::run_stop(dir, force, json),
            DaemonCommands::Restart => commands::daemon::run_restart(dir, json),
            DaemonCommands::Status => commands::daemon::run_status(dir, json),
            DaemonCommands::Health => commands::daemon::run_health(dir, json),
            DaemonCommands::Run { args } => run_daemon(dir, args.into_options()),
            DaemonCommands::Watchdog { args } => run_watchdog(dir, args.into_options()),
        },
    }
}

fn report_error(error: &anyhow::Error, json: bool) {
    let daemon = error.downcast_ref::<DaemonError>();
    if json {
        let output = serde_json::json!({
            "error": format!("{:#}", error),
            "code": daemon.map(|d| d.code()),
            "hint": daemon.map(|d| d.hint()),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
        );
        return;
    }
    match daemon {
        Some(d) => {
            eprintln!("Error [{}]: {}", d.code(), d);
            eprintln!("Hint: {}", d.hint());
        }
        None => eprintln!("Error: {:#}", error),
    }
}
