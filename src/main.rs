use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};

use wud::ledger::WuStatus;
use wud::observability;
use wud::reconcile::DiagnoseOptions;
use wud::{WuOps, WudConfig};

#[derive(Parser)]
#[command(
    name = "wud",
    about = "Work-unit coordination over a shared Git repository",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Repository root (defaults to the current directory)
    #[arg(long, env = "WUD_ROOT")]
    root: Option<PathBuf>,

    /// Directory for transaction worktrees (overrides config)
    #[arg(long, env = "WUD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "WUD_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new work unit
    Create {
        id: String,
        #[arg(long)]
        lane: String,
        #[arg(long)]
        title: String,
    },
    /// Claim an existing work unit
    Claim { id: String },
    /// Mark a work unit blocked
    Block {
        id: String,
        #[arg(long)]
        note: Option<String>,
    },
    /// Return a blocked work unit to in-progress
    Unblock { id: String },
    /// Mark a work unit done
    Complete { id: String },
    /// Record a progress note without changing status
    Checkpoint { id: String, note: String },
    /// Register a work unit as delegated from a parent
    Delegate {
        id: String,
        #[arg(long)]
        parent: String,
    },
    /// Return a work unit to the available pool
    Release {
        id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Show the projected state of the ledger
    Status {
        #[arg(long)]
        lane: Option<String>,
    },
    /// Compare task documents against the ledger and report divergences
    Diagnose {
        /// Emit corrective events for auto-fixable divergences
        #[arg(long)]
        fix: bool,
    },
    /// Sweep abandoned transaction workspaces
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    observability::init_tracing(args.log.as_deref());

    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let mut config = WudConfig::load(&root)?;
    if args.data_dir.is_some() {
        config.txn.data_dir = args.data_dir;
    }
    let ops = WuOps::new(&root, config);

    match args.command {
        Command::Create { id, lane, title } => {
            ops.create(&id, &lane, &title).await?;
            println!("created {id}");
        }
        Command::Claim { id } => {
            ops.claim(&id).await?;
            println!("claimed {id}");
        }
        Command::Block { id, note } => {
            ops.block(&id, note).await?;
            println!("blocked {id}");
        }
        Command::Unblock { id } => {
            ops.unblock(&id).await?;
            println!("unblocked {id}");
        }
        Command::Complete { id } => {
            ops.complete(&id).await?;
            println!("completed {id}");
        }
        Command::Checkpoint { id, note } => {
            ops.checkpoint(&id, &note).await?;
            println!("checkpointed {id}");
        }
        Command::Delegate { id, parent } => {
            ops.delegate(&id, &parent).await?;
            println!("delegated {id} from {parent}");
        }
        Command::Release { id, reason } => {
            ops.release(&id, reason).await?;
            println!("released {id}");
        }
        Command::Status { lane } => {
            print_status(&ops, lane.as_deref()).await?;
        }
        Command::Diagnose { fix } => {
            let report = ops.diagnose(DiagnoseOptions { fix }).await?;
            for issue in &report.issues {
                println!(
                    "{}: declared {} / derived {} [{}]",
                    issue.wu_id,
                    issue.declared,
                    issue.derived,
                    serde_json::to_string(&issue.class)?.trim_matches('"'),
                );
            }
            println!("{} issue(s), {} fixed", report.issues.len(), report.fixed);
        }
        Command::Cleanup => {
            let removed = ops.cleanup().await?;
            println!("removed {removed} stale workspace(s)");
        }
    }

    Ok(())
}

async fn print_status(ops: &WuOps, lane: Option<&str>) -> Result<()> {
    let state = ops.state().await?;

    for status in [
        WuStatus::Ready,
        WuStatus::InProgress,
        WuStatus::Blocked,
        WuStatus::Done,
    ] {
        let mut ids: Vec<&str> = state
            .in_status(status)
            .filter(|id| {
                lane.map_or(true, |lane| {
                    state.entry(id).map_or(false, |e| e.lane == lane)
                })
            })
            .collect();
        if ids.is_empty() {
            continue;
        }
        ids.sort_unstable();

        println!("{status}:");
        for id in ids {
            if let Some(entry) = state.entry(id) {
                println!("  {id} [{}] {}", entry.lane, entry.title);
            }
        }
    }

    Ok(())
}
