//! The `ringside` binary: demo arena, config inspection, and offline
//! decisions over saved metrics snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use ringside_agents::{AgentPool, SimulatedAgent};
use ringside_decision::FightPolicy;
use ringside_engine::{
    ChallengeCoordinator, EngineConfig, MemoryRecorder, MemoryStatsStore, StatsStore,
};
use ringside_metrics::MetricsSnapshot;
use ringside_protocol::{ChannelRef, FightKind, LifecycleEvent, UserId, WatcherId};

#[derive(Parser)]
#[command(name = "ringside")]
#[command(about = "Challenge/fight orchestration engine", long_about = None)]
struct Cli {
    /// Path to a TOML config; defaults to the platform config dir.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage fights between simulated participants and watchers
    Run {
        /// Fights to stage before printing the leaderboard
        #[arg(long, default_value_t = 3)]
        fights: u32,
        /// Simulated watcher agents to register
        #[arg(long, default_value_t = 2)]
        watchers: u32,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Judge a saved metrics snapshot without running a fight
    Decide {
        /// JSON metrics snapshot file
        snapshot: PathBuf,
        /// Fight kind to judge it as
        #[arg(long, default_value = "volume")]
        kind: FightKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run { fights, watchers } => {
            if cli.config.is_none() {
                demo_profile(&mut config);
            }
            run_demo(config, fights, watchers).await
        }
        Commands::Config => print_config(&config),
        Commands::Decide { snapshot, kind } => decide_offline(&config, &snapshot, kind),
    }
}

/// Tighten the timers so a demo round finishes in seconds, not minutes.
fn demo_profile(config: &mut EngineConfig) {
    config.accept_timeout_secs = 5;
    config.join_timeout_secs = 5;
    config.max_fight_secs = 10;
    config.sample_interval_secs = 1;
}

async fn run_demo(config: EngineConfig, fights: u32, watchers: u32) -> Result<()> {
    if fights == 0 {
        bail!("nothing to do with --fights 0");
    }

    let alice = UserId::new("alice");
    let bob = UserId::new("bob");
    let channel = ChannelRef::new("arena");

    let pool = AgentPool::new();
    for index in 0..watchers {
        pool.register(Arc::new(SimulatedAgent::generated(
            WatcherId::new(format!("sim-{index}")),
            vec![alice.clone(), bob.clone()],
            40 + index as u64,
        )))
        .await;
    }

    let store = Arc::new(MemoryStatsStore::new());
    let recorder = Arc::new(MemoryRecorder::new());
    let coordinator = ChallengeCoordinator::new(config, pool, store.clone(), recorder);

    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::FightEnded { outcome, .. }) => {
                    println!(
                        "  fight ended: {} ({}, confidence {:.2})",
                        outcome.verdict, outcome.basis, outcome.confidence
                    );
                }
                Ok(LifecycleEvent::SessionVoided { reason, .. }) => {
                    println!("  session voided: {reason}");
                }
                Ok(event) => println!("  {}", event.tag()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("  (skipped {n} events)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run(shutdown_rx).await })
    };

    for round in 0..fights {
        let (challenger, challengee) = if round % 2 == 0 {
            (alice.clone(), bob.clone())
        } else {
            (bob.clone(), alice.clone())
        };
        let kind = if round % 2 == 0 {
            FightKind::Volume
        } else {
            FightKind::Timing
        };
        println!(
            "round {}: {challenger} challenges {challengee} to a {kind} fight",
            round + 1
        );

        let challenge_id = coordinator
            .issue_challenge(challenger, challengee.clone(), channel.clone())
            .await?;
        coordinator.respond(&challenge_id, &challengee, true).await?;
        let session_id = coordinator.select_fight_type(&challenge_id, kind).await?;

        loop {
            match coordinator.session_state(&session_id).await {
                Some(state) if state.is_terminal() => break,
                None => break,
                Some(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = runner.await;
    printer.abort();

    println!("leaderboard:");
    for (user, record) in store.leaderboard(10).await? {
        println!(
            "  {user}: {}W/{}L/{}D over {} fights",
            record.wins, record.losses, record.draws, record.total_fights
        );
    }
    Ok(())
}

fn print_config(config: &EngineConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("rendering configuration")?;
    print!("{rendered}");
    Ok(())
}

fn decide_offline(config: &EngineConfig, path: &Path, kind: FightKind) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let snapshot: MetricsSnapshot =
        serde_json::from_str(&raw).context("parsing metrics snapshot")?;
    let policy = FightPolicy::for_kind(kind, &config.decision_config());
    let decision = policy.evaluate(&snapshot);
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(())
}
