//! Race Raft against Multi-Paxos on the same simulated network.
//!
//! Spins up one cluster per engine and size, replicates a batch of
//! commands, waits for every node to apply them, and reports wall time,
//! elections, and wire traffic.

use std::time::{Duration, Instant};

use clap::Parser;
use conclave::{Cluster, ClusterConfig, Command, EngineKind, ProposeError, Slot};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "compare")]
#[command(about = "Race Raft against Multi-Paxos on a simulated lossy network")]
struct Args {
    /// Cluster sizes to run
    #[arg(short, long, default_values_t = [3usize, 5, 7])]
    sizes: Vec<usize>,

    /// Commands to replicate per run
    #[arg(short, long, default_value_t = 20)]
    commands: u64,

    /// Master seed for timers and the network
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

const WAIT: Duration = Duration::from_secs(10);

struct RunReport {
    elapsed: Duration,
    elections: u64,
    leader_transitions: u64,
    sent: u64,
    delivered: u64,
}

async fn replicate(cluster: &Cluster, commands: u64) -> Result<(), ProposeError> {
    for i in 0..commands {
        let command = Command::put(format!("key-{i}"), format!("value-{i}"));
        let mut tries = 0;
        loop {
            match cluster.propose(command.clone()).await {
                Ok(()) => break,
                // Leadership can churn mid-batch; wait out the election.
                Err(ProposeError::NotLeader { .. }) if tries < 100 => {
                    tries += 1;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
    Ok(())
}

async fn run_one(
    kind: EngineKind,
    size: usize,
    commands: u64,
    seed: u64,
) -> Result<RunReport, Box<dyn std::error::Error>> {
    let start = Instant::now();
    let mut cluster = Cluster::new(kind, ClusterConfig::with_seed(size, seed));

    cluster.await_leader(WAIT).await?;
    replicate(&cluster, commands).await?;
    let target = Slot::new(commands);
    for id in cluster.members().to_vec() {
        cluster.await_applied(id, target, WAIT).await?;
    }

    let elapsed = start.elapsed();
    let snapshots = cluster.snapshots();
    let net = cluster.net_stats();
    cluster.shutdown();
    Ok(RunReport {
        elapsed,
        elections: snapshots.iter().map(|s| s.stats.elections_started).sum(),
        leader_transitions: snapshots.iter().map(|s| s.stats.leader_transitions).sum(),
        sent: net.sent,
        delivered: net.delivered,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    for &size in &args.sizes {
        for kind in [EngineKind::Raft, EngineKind::Paxos] {
            let report = run_one(kind, size, args.commands, args.seed).await?;
            info!(
                engine = ?kind,
                size,
                commands = args.commands,
                elapsed = ?report.elapsed,
                elections = report.elections,
                leader_transitions = report.leader_transitions,
                sent = report.sent,
                delivered = report.delivered,
                "run complete"
            );
        }
    }
    Ok(())
}
