//! End-to-end Raft scenarios on the simulated network.
//!
//! Every test runs under paused time with a fixed seed, so the fault
//! schedule and the protocol's reaction to it replay identically.

use std::collections::BTreeSet;
use std::time::Duration;

use conclave::{
    Cluster, ClusterConfig, Command, EngineKind, NodeId, ProposeError, Role, Slot, WaitError,
};

/// Initialize tracing for tests. Call at the start of each test.
/// Uses the RUST_LOG env var for filtering (defaults to "conclave=debug").
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("conclave=debug")),
        )
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

const WAIT: Duration = Duration::from_secs(30);

/// Propose, waiting out any leadership churn in between.
async fn propose_retry(cluster: &Cluster, command: Command) {
    for _ in 0..500 {
        match cluster.propose(command.clone()).await {
            Ok(()) => return,
            Err(ProposeError::NotLeader { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(error) => panic!("proposal failed: {error}"),
        }
    }
    panic!("no leader ever took the proposal");
}

/// Wait for a leader claim from one of `allowed`, ignoring stale claims
/// from everyone else.
async fn await_leader_among(cluster: &Cluster, allowed: &[NodeId]) -> NodeId {
    for _ in 0..1000 {
        if let Some(id) = cluster.leader() {
            if allowed.contains(&id) {
                return id;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader emerged among {allowed:?}");
}

/// Propose and wait until the command shows up in somebody's state
/// machine, re-proposing if churn swallowed it.
async fn replicate_confirmed(cluster: &Cluster, key: &str, value: &str) {
    for _ in 0..50 {
        propose_retry(cluster, Command::put(key, value)).await;
        for _ in 0..100 {
            if cluster
                .snapshots()
                .iter()
                .any(|snap| snap.kv.contains_key(key))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    panic!("command {key} never committed");
}

#[tokio::test(start_paused = true)]
async fn five_nodes_replicate_ten_commands() {
    let _guard = init_tracing();
    let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 1));

    cluster.await_leader(WAIT).await.unwrap();
    for i in 0..10 {
        propose_retry(&cluster, Command::put(format!("k{i}"), format!("v{i}"))).await;
    }

    let target = Slot::new(10);
    for id in cluster.members().to_vec() {
        let snap = cluster.await_applied(id, target, WAIT).await.unwrap();
        assert_eq!(snap.status.commit_index, target);
        assert_eq!(snap.kv.len(), 10);
    }

    let logs: Vec<_> = cluster.snapshots().into_iter().map(|s| s.log).collect();
    for pair in logs.windows(2) {
        assert_eq!(pair[0], pair[1], "every committed log must be identical");
    }
}

#[tokio::test(start_paused = true)]
async fn killed_leader_fails_over_to_a_higher_term() {
    let _guard = init_tracing();
    let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 2));

    let first = cluster.await_leader(WAIT).await.unwrap();
    let first_term = cluster.snapshot(first).unwrap().status.term;

    propose_retry(&cluster, Command::put("before", "kill")).await;
    cluster.await_applied(first, Slot::new(1), WAIT).await.unwrap();
    cluster.kill(first);

    let second = cluster.await_leader(WAIT).await.unwrap();
    assert_ne!(second, first);
    let second_term = cluster.snapshot(second).unwrap().status.term;
    assert!(
        second_term > first_term,
        "new leadership must carry a strictly higher term"
    );

    propose_retry(&cluster, Command::put("after", "failover")).await;
    let snap = cluster
        .await_applied(second, Slot::new(2), WAIT)
        .await
        .unwrap();
    assert_eq!(snap.kv.get("before").map(String::as_str), Some("kill"));
    assert_eq!(snap.kv.get("after").map(String::as_str), Some("failover"));

    // No two leader claims, live or dead, ever share a term.
    let mut terms = BTreeSet::new();
    for snap in cluster.snapshots() {
        if snap.status.role == Role::Leader {
            assert!(terms.insert(snap.status.term), "two leaders in one term");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn minority_partition_stalls_while_majority_commits() {
    let _guard = init_tracing();
    let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 3));

    let old_leader = cluster.await_leader(WAIT).await.unwrap();
    propose_retry(&cluster, Command::put("pre", "split")).await;
    cluster
        .await_applied(old_leader, Slot::new(1), WAIT)
        .await
        .unwrap();

    // Strand the leader with a single follower.
    let loyal = cluster
        .members()
        .iter()
        .copied()
        .find(|&id| id != old_leader)
        .unwrap();
    let minority = [old_leader, loyal];
    let majority: Vec<NodeId> = cluster
        .members()
        .iter()
        .copied()
        .filter(|id| !minority.contains(id))
        .collect();
    cluster.partition(minority);

    let new_leader = await_leader_among(&cluster, &majority).await;
    propose_retry(&cluster, Command::put("post", "majority")).await;
    cluster
        .await_applied(new_leader, Slot::new(2), WAIT)
        .await
        .unwrap();

    // The stranded side holds its old commit and gets nothing new.
    let stuck = cluster
        .await_applied(old_leader, Slot::new(2), Duration::from_secs(5))
        .await;
    assert!(matches!(stuck, Err(WaitError::Timeout)));
    for id in minority {
        let snap = cluster.snapshot(id).unwrap();
        assert_eq!(snap.status.commit_index, Slot::new(1));
    }
}

#[tokio::test(start_paused = true)]
async fn healing_truncates_the_minority_fork() {
    let _guard = init_tracing();
    let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 4));

    let old_leader = cluster.await_leader(WAIT).await.unwrap();
    propose_retry(&cluster, Command::put("pre", "split")).await;
    cluster
        .await_applied(old_leader, Slot::new(1), WAIT)
        .await
        .unwrap();

    let loyal = cluster
        .members()
        .iter()
        .copied()
        .find(|&id| id != old_leader)
        .unwrap();
    let minority = [old_leader, loyal];
    let majority: Vec<NodeId> = cluster
        .members()
        .iter()
        .copied()
        .filter(|id| !minority.contains(id))
        .collect();
    cluster.partition(minority);

    // The deposed-but-unaware leader appends a doomed entry.
    let fork = Command::put("fork", "lost");
    cluster.propose_to(old_leader, fork.clone()).await.unwrap();

    // Meanwhile the majority commits different entries at those slots.
    await_leader_among(&cluster, &majority).await;
    propose_retry(&cluster, Command::put("keep1", "one")).await;
    propose_retry(&cluster, Command::put("keep2", "two")).await;

    cluster.heal();

    for id in cluster.members().to_vec() {
        let snap = cluster.await_applied(id, Slot::new(3), WAIT).await.unwrap();
        assert_eq!(snap.kv.get("fork"), None, "forked entry must never apply");
        assert_eq!(snap.kv.get("keep1").map(String::as_str), Some("one"));
        assert_eq!(snap.kv.get("keep2").map(String::as_str), Some("two"));
    }

    // The forked suffix is overwritten everywhere, old leader included.
    for snap in cluster.snapshots() {
        assert!(
            snap.log.entries().iter().all(|e| e.command != fork),
            "node {:?} still carries the forked entry",
            snap.id
        );
    }
}

#[tokio::test(start_paused = true)]
async fn duplicated_delivery_changes_nothing() {
    let _guard = init_tracing();
    let mut config = ClusterConfig::with_seed(3, 5);
    config.network.duplicate = 0.5;
    let mut cluster = Cluster::new(EngineKind::Raft, config);

    cluster.await_leader(WAIT).await.unwrap();
    for i in 0..5 {
        propose_retry(&cluster, Command::put(format!("k{i}"), format!("v{i}"))).await;
    }

    for id in cluster.members().to_vec() {
        let snap = cluster.await_applied(id, Slot::new(5), WAIT).await.unwrap();
        assert_eq!(snap.status.commit_index, Slot::new(5));
        assert_eq!(snap.log.last_index(), Slot::new(5), "no phantom entries");
        assert_eq!(snap.kv.len(), 5);
    }

    let net = cluster.net_stats();
    assert!(net.duplicated > 0, "the duplication fault never fired");
}

#[tokio::test(start_paused = true)]
async fn replication_survives_heavy_loss() {
    let _guard = init_tracing();
    let mut config = ClusterConfig::with_seed(3, 6);
    config.network.loss = 0.3;
    let mut cluster = Cluster::new(EngineKind::Raft, config);

    cluster.await_leader(WAIT).await.unwrap();
    for i in 0..5 {
        replicate_confirmed(&cluster, &format!("k{i}"), &format!("v{i}")).await;
    }

    // Let replication quiesce, then check the survivors agree on every
    // slot they have both committed.
    for _ in 0..200 {
        let snaps = cluster.snapshots();
        let all_keys = snaps
            .iter()
            .all(|s| (0..5).all(|i| s.kv.contains_key(&format!("k{i}"))));
        if all_keys {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let snaps = cluster.snapshots();
    for snap in &snaps {
        for i in 0..5 {
            let key = format!("k{i}");
            assert_eq!(
                snap.kv.get(&key).map(String::as_str),
                Some(format!("v{i}").as_str()),
                "node {:?} missing {key}",
                snap.id
            );
        }
    }
    for a in &snaps {
        for b in &snaps {
            let shared = a.status.commit_index.min(b.status.commit_index);
            for n in 1..=shared.get() {
                let slot = Slot::new(n);
                assert_eq!(a.log.get(slot), b.log.get(slot), "divergence at {slot:?}");
            }
        }
    }

    let net = cluster.net_stats();
    assert!(net.dropped_loss > 0, "the loss fault never fired");
}

#[tokio::test(start_paused = true)]
async fn restarted_follower_catches_up() {
    let _guard = init_tracing();
    let mut cluster = Cluster::new(EngineKind::Raft, ClusterConfig::with_seed(5, 7));

    let leader = cluster.await_leader(WAIT).await.unwrap();
    propose_retry(&cluster, Command::put("k1", "v1")).await;
    cluster.await_applied(leader, Slot::new(1), WAIT).await.unwrap();

    let follower = cluster
        .members()
        .iter()
        .copied()
        .find(|&id| id != leader)
        .unwrap();
    cluster
        .await_applied(follower, Slot::new(1), WAIT)
        .await
        .unwrap();
    let term_at_kill = cluster.snapshot(follower).unwrap().status.term;
    cluster.kill(follower);

    propose_retry(&cluster, Command::put("k2", "v2")).await;
    propose_retry(&cluster, Command::put("k3", "v3")).await;

    cluster.restart(follower);
    let snap = cluster
        .await_applied(follower, Slot::new(3), WAIT)
        .await
        .unwrap();
    assert_eq!(snap.kv.len(), 3);
    assert!(
        snap.status.term >= term_at_kill,
        "restart must not forget the term"
    );

    let leader_log = cluster.snapshot(cluster.leader().unwrap()).unwrap().log;
    assert_eq!(snap.log, leader_log, "rejoined log must match the leader's");
}
