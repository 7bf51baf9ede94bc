//! Hive command-line entry point.
//!
//! Summons agents under a root in the current directory. Agent state and
//! the notification log persist under `.hive/store/`, so `status` and
//! `replay` work after the summoning process has exited.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use hive::core::commitment::{Check, Commitment};
use hive::core::types::{AgentState, DoneBehavior};
use hive::events::{Event, EventBus};
use hive::exit_codes;
use hive::io::config::load_config;
use hive::io::init::{HivePaths, InitOptions, init_hive};
use hive::io::records::load_agents;
use hive::io::store::FileStore;
use hive::logging;
use hive::orchestrator::{Orchestrator, Services};
use hive::spawner::{Initiator, SpawnConfig};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const DRAIN_QUIET: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "hive", version, about = "Hierarchical agent orchestration")]
struct Cli {
    /// Project root containing `.hive/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.hive/` with a default config.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Summon a worker under the root and wait for it to finish.
    Summon {
        /// Work to delegate. Without it the worker idles until messaged.
        #[arg(short, long)]
        assignment: Option<String>,
        #[arg(short, long)]
        name: Option<String>,
        /// Commitment as `DESCRIPTION::SHELL COMMAND`. Repeatable.
        #[arg(short, long = "commit", value_parser = parse_commitment)]
        commitments: Vec<Commitment>,
        #[arg(long)]
        token_budget: Option<u64>,
    },
    /// Print persisted agents that are still live.
    Status {
        /// Include retired agents.
        #[arg(long)]
        all: bool,
    },
    /// Print the notification log as JSON lines.
    Replay,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_hive(&cli.root, &InitOptions { force })?;
            println!("initialized {}", paths.hive_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Summon {
            assignment,
            name,
            commitments,
            token_budget,
        } => {
            let config = SpawnConfig {
                assignment,
                token_budget,
                name,
                initial_commitments: commitments,
                done_behavior: DoneBehavior::Terminate,
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build tokio runtime")?;
            runtime.block_on(cmd_summon(&cli.root, config))
        }
        Command::Status { all } => cmd_status(&cli.root, all),
        Command::Replay => cmd_replay(&cli.root),
    }
}

fn parse_commitment(raw: &str) -> Result<Commitment, String> {
    let (description, command) = raw
        .split_once("::")
        .ok_or_else(|| "expected DESCRIPTION::COMMAND".to_string())?;
    if description.trim().is_empty() || command.trim().is_empty() {
        return Err("description and command must be non-empty".to_string());
    }
    Ok(Commitment::new(description.trim(), Check::shell(command.trim())))
}

fn open_paths(root: &Path) -> Result<HivePaths> {
    let paths = HivePaths::new(root);
    if !paths.hive_dir.is_dir() {
        bail!("{} not found (run `hive init`)", paths.hive_dir.display());
    }
    Ok(paths)
}

async fn cmd_summon(root: &Path, spawn: SpawnConfig) -> Result<i32> {
    let paths = open_paths(root)?;
    let config = load_config(&paths.config_path)?;
    let services = Services::from_config(&config, &paths);
    let orchestrator = Orchestrator::start(&config, paths.root.clone(), services)?;
    let events = orchestrator.subscribe();

    let initiator = if spawn.assignment.is_some() {
        Initiator::Parent(orchestrator.root().id())
    } else {
        Initiator::User
    };
    let id = orchestrator.summon(initiator, spawn).await?;
    let handle = orchestrator
        .agent(id)
        .ok_or_else(|| anyhow!("agent {id} exited before it could be observed"))?;
    println!("summoned {} ({id})", handle.name());

    let stop = CancellationToken::new();
    let printer = tokio::spawn(print_events(events, stop.clone(), DRAIN_QUIET, std::io::stdout()));

    let last = handle
        .wait_for(|s| s.retired || s.state.is_terminal() || s.state == AgentState::WaitingForInput)
        .await?;
    orchestrator.shutdown();
    stop.cancel();
    if let Err(err) = printer.await {
        warn!(err = %err, "event printer stopped abnormally");
    }

    Ok(match last.state {
        AgentState::Done => exit_codes::OK,
        AgentState::WaitingForInput => exit_codes::WAITING,
        _ => exit_codes::REAPED,
    })
}

/// Write each notification as a JSON line. Once `stop` fires, keep going
/// until the stream has been quiet for `quiet`, so notifications from the
/// shutdown itself are not lost.
async fn print_events<W: Write>(
    mut events: broadcast::Receiver<Event>,
    stop: CancellationToken,
    quiet: Duration,
    mut out: W,
) -> W {
    loop {
        let next = if stop.is_cancelled() {
            match tokio::time::timeout(quiet, events.recv()).await {
                Ok(next) => next,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                next = events.recv() => next,
                () = stop.cancelled() => continue,
            }
        };
        match next {
            Ok(event) => match serde_json::to_string(&event.notification) {
                Ok(line) => {
                    if writeln!(out, "{line}").is_err() {
                        break;
                    }
                }
                Err(err) => warn!(seq = event.seq, err = %err, "failed to serialize event"),
            },
            Err(RecvError::Lagged(missed)) => warn!(missed, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
    let _ = out.flush();
    out
}

fn cmd_status(root: &Path, all: bool) -> Result<i32> {
    let paths = open_paths(root)?;
    let store = FileStore::new(&paths.store_dir);
    let mut records = load_agents(&store)?;
    records.sort_by(|a, b| a.name.cmp(&b.name));
    for record in records.iter().filter(|r| all || !r.retired) {
        let budget = record
            .token_budget
            .map_or_else(|| "-".to_string(), |budget| budget.to_string());
        println!(
            "{}\t{}\t{}\ttokens={}/{}{}",
            record.name,
            record.kind.as_str(),
            record.state,
            record.tokens_used,
            budget,
            if record.retired { "\tretired" } else { "" }
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_replay(root: &Path) -> Result<i32> {
    let paths = open_paths(root)?;
    let store = FileStore::new(&paths.store_dir);
    for event in EventBus::replay(&store)? {
        let line = serde_json::to_string(&event).context("serialize event")?;
        println!("{line}");
    }
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hive::core::types::AgentId;
    use hive::events::Notification;
    use hive::io::store::MemoryStore;

    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["hive", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_summon_with_commitments() {
        let cli = Cli::parse_from([
            "hive",
            "summon",
            "--assignment",
            "build X",
            "--commit",
            "tests pass::cargo test",
            "--commit",
            "binary exists::test -f target/x",
        ]);
        let Command::Summon {
            assignment,
            commitments,
            ..
        } = cli.command
        else {
            panic!("expected summon");
        };
        assert_eq!(assignment.as_deref(), Some("build X"));
        assert_eq!(commitments.len(), 2);
        assert_eq!(commitments[0].description(), "tests pass");
        assert_eq!(commitments[0].check(), &Check::shell("cargo test"));
    }

    #[test]
    fn malformed_commitment_is_rejected() {
        assert!(parse_commitment("no separator").is_err());
        assert!(parse_commitment("::cmd").is_err());
    }

    #[test]
    fn status_reads_persisted_agents() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_hive(temp.path(), &InitOptions { force: false }).expect("init");
        assert_eq!(cmd_status(temp.path(), false).expect("status"), exit_codes::OK);
        assert!(cmd_status(&temp.path().join("missing"), false).is_err());
    }

    #[tokio::test]
    async fn printer_drains_events_published_after_stop() {
        let bus = EventBus::open(Arc::new(MemoryStore::new())).expect("bus");
        let stop = CancellationToken::new();
        let printer = tokio::spawn(print_events(
            bus.subscribe(),
            stop.clone(),
            Duration::from_millis(100),
            Vec::new(),
        ));

        let id = AgentId::new();
        let retired = |name: &str| Notification::Retired {
            agent_id: id,
            agent_name: name.to_string(),
            timestamp: chrono::Utc::now(),
        };
        bus.publish(retired("ada"));
        stop.cancel();
        bus.publish(retired("bee"));

        let out = printer.await.expect("printer");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"ada\""));
        assert!(lines[1].contains("\"bee\""));
    }
}
