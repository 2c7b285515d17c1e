use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;

use hive::analysis::{merge_with_stats, Finding, PriorityMatrix, Quadrant};
use hive::bus::JsonlLog;
use hive::core::JsonTaskStore;
use hive::{
    hlog, ClaimOutcome, Config, MessageBus, MessageFilter, MessageType, Outcome,
    ReportOutcome, Result, Role, Scheduler, TaskDescriptor, TaskId,
};

/// Hive - task dependency scheduler for role-based worker swarms
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    HIVE_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.hive/hive.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Directory holding tasks.json and messages.jsonl
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Team name stamped on published messages
    #[arg(long, global = true)]
    pub team: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Add a task
    Enqueue {
        /// Routing subject, e.g. SCAN-auth
        subject: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Ids of tasks this one waits on
        #[arg(long = "after", value_delimiter = ',')]
        depends_on: Vec<String>,

        /// Restrict the task to one role
        #[arg(long)]
        owner: Option<String>,

        /// JSON payload handed to the worker
        #[arg(long)]
        payload: Option<String>,
    },

    /// Claim the next ready task for a role
    Claim {
        /// Role name
        role: String,

        /// Subject prefix the role handles
        prefix: String,
    },

    /// Report the outcome of a claimed task
    Report {
        id: String,

        /// Mark the task failed with this error instead of completed
        #[arg(long)]
        failed: Option<String>,

        /// Pointer to the produced artifact
        #[arg(long = "ref")]
        artifact_ref: Option<String>,
    },

    /// Move a failed task back to pending
    Retry { id: String },

    /// Move a blocked task back to pending
    Release { id: String },

    /// Fail an in-progress task without retry
    Cancel {
        id: String,

        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Print wave assignments
    Waves,

    /// Check the task graph for cycles and unknown references
    Validate {
        /// Treat unknown references as errors
        #[arg(long)]
        strict: bool,
    },

    /// Show task counts by status
    Status,

    /// Print bus messages
    Log {
        #[arg(long)]
        from: Option<String>,

        #[arg(long)]
        to: Option<String>,

        /// Message type, e.g. scan_complete (repeatable)
        #[arg(long = "type")]
        kinds: Vec<String>,

        /// Only messages after this sequence number
        #[arg(long, default_value_t = 0)]
        after: u64,

        /// Keep following the log
        #[arg(short, long)]
        follow: bool,
    },

    /// Deduplicate and prioritize a JSON array of findings
    Assess {
        /// File containing the findings
        findings: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    hive::log::init_with_debug(cli.debug);
    if hive::log::is_debug() {
        hlog!("hive starting (debug mode enabled): {:?}", cli.command);
    }

    let mut config = Config::load()?;
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.to_string_lossy().into_owned());
    }
    if let Some(team) = &cli.team {
        config.team = team.clone();
    }

    if let Command::Assess { findings } = &cli.command {
        return run_assess(findings);
    }

    config.ensure_dirs()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

fn open_scheduler(config: &Config) -> Result<Scheduler> {
    let store = JsonTaskStore::open(config.tasks_path()?)?;
    let log = JsonlLog::open(config.messages_path()?)?;
    let bus = MessageBus::new(Arc::new(log), &config.team).with_retry(config.retry_policy());
    Ok(Scheduler::new(Arc::new(store), bus).with_retry_policy(config.retry_policy()))
}

fn parse_id(id: &str) -> Result<TaskId> {
    TaskId::parse(id)
}

async fn run(command: Command, config: Config) -> Result<()> {
    let scheduler = open_scheduler(&config)?;

    match command {
        Command::Enqueue {
            subject,
            id,
            depends_on,
            owner,
            payload,
        } => {
            let desc = TaskDescriptor {
                id,
                subject,
                owner,
                depends_on,
                payload: match payload {
                    Some(p) => serde_json::from_str(&p)?,
                    None => serde_json::Value::Null,
                },
            };
            let id = scheduler.enqueue(desc).await?;
            println!("{}", id);
        }

        Command::Claim { role, prefix } => {
            match scheduler.claim(&Role::new(&role, &prefix)).await? {
                ClaimOutcome::Claimed(task) => {
                    println!("{}", serde_json::to_string_pretty(&task)?);
                }
                ClaimOutcome::Idle => println!("idle"),
            }
        }

        Command::Report {
            id,
            failed,
            artifact_ref,
        } => {
            let outcome = match failed {
                Some(error) => Outcome::Failed { error },
                None => Outcome::Completed,
            };
            match scheduler.report(&parse_id(&id)?, outcome, artifact_ref).await? {
                ReportOutcome::Completed(task) => println!("{} completed", task.id),
                ReportOutcome::RetryScheduled { task, attempt, delay } => {
                    println!("{} failed (attempt {}), retry in {:?}", task.id, attempt, delay)
                }
                ReportOutcome::Failed(task) => {
                    println!("{} failed after {} attempts", task.id, task.attempts)
                }
            }
        }

        Command::Retry { id } => {
            let task = scheduler.retry(&parse_id(&id)?).await?;
            println!("{} {}", task.id, task.status);
        }

        Command::Release { id } => {
            let task = scheduler.release(&parse_id(&id)?).await?;
            println!("{} {}", task.id, task.status);
        }

        Command::Cancel { id, reason } => {
            let task = scheduler.cancel(&parse_id(&id)?, &reason).await?;
            println!("{} {}", task.id, task.status);
        }

        Command::Waves => {
            let waves = scheduler.waves().await?;
            for (n, layer) in waves.layers().into_iter().enumerate() {
                let ids: Vec<&str> = layer.iter().map(|id| id.as_str()).collect();
                println!("wave {}: {}", n + 1, ids.join(" "));
            }
        }

        Command::Validate { strict } => {
            let report = scheduler.validate().await?;
            for d in &report.dangling {
                println!("warning: {} depends on unknown task {}", d.task, d.missing);
            }
            if strict {
                if let Some(d) = report.dangling.into_iter().next() {
                    return Err(d.into());
                }
            }
            println!(
                "ok: {} tasks in {} waves",
                report.waves.len(),
                report.waves.depth()
            );
        }

        Command::Status => {
            let summary = scheduler.status_summary().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Command::Log {
            from,
            to,
            kinds,
            after,
            follow,
        } => {
            let mut filter = MessageFilter::all();
            filter.from = from;
            filter.to = to;
            for kind in &kinds {
                filter = filter.kind(kind.parse::<MessageType>()?);
            }

            if follow {
                let stream = scheduler
                    .bus()
                    .tail(filter, after, Duration::from_millis(config.idle_poll_ms));
                tokio::pin!(stream);
                while let Some(msg) = stream.next().await {
                    println!("{}", serde_json::to_string(&msg?)?);
                }
            } else {
                for msg in scheduler.bus().query_after(filter, after) {
                    println!("{}", serde_json::to_string(&msg?)?);
                }
            }
        }

        Command::Assess { findings } => run_assess(&findings)?,
    }
    Ok(())
}

fn run_assess(path: &Path) -> Result<()> {
    hlog!("Assess command: findings={}", path.display());
    let findings: Vec<Finding> = serde_json::from_str(&fs::read_to_string(path)?)?;
    hlog!("{} findings loaded", findings.len());

    let (merged, stats) = merge_with_stats(findings);
    let matrix = PriorityMatrix::build(merged);
    let counts: serde_json::Map<String, serde_json::Value> = Quadrant::ALL
        .iter()
        .map(|q| (q.to_string(), matrix.count(*q).into()))
        .collect();

    let output = serde_json::json!({
        "dedup": stats,
        "counts": counts,
        "matrix": matrix,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
