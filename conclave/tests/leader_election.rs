mod fixtures;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::ClusterError;
use conclave::Config;
use conclave::LockMode;
use conclave::State;
use fixtures::ClusterRouter;
use maplit::btreemap;

/// Build per-node configs over the same roster where `fast` gets a much
/// shorter election window than everyone else, so it reliably fires first.
fn seeded_configs(ids: &[&str], fast: &str) -> BTreeMap<String, Arc<Config>> {
    let members: BTreeMap<String, String> =
        ids.iter().map(|id| (id.to_string(), format!("local://{}", id))).collect();
    ids.iter()
        .map(|id| {
            let (min, max) = if *id == fast { (150, 160) } else { (400, 500) };
            let config = Config::build("seeded".into())
                .members(members.clone())
                .election_timeout_min(min)
                .election_timeout_max(max)
                .validate()
                .expect("failed to build config");
            (id.to_string(), Arc::new(config))
        })
        .collect()
}

/// Leader election on clean start.
///
/// Three nodes come up with node-a seeded to fire its election timer first.
/// node-a must win term 1, and every node's status must report it as leader
/// shortly after.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_election_on_clean_start() -> Result<()> {
    fixtures::init_tracing();

    let ids = ["node-a", "node-b", "node-c"];
    let configs = seeded_configs(&ids, "node-a");
    let router = ClusterRouter::new();
    for id in &ids {
        router.new_node(id, configs[*id].clone()).await;
    }

    router
        .wait_for_metrics(
            "node-a",
            |m| m.state == State::Leader && m.current_term == 1,
            Duration::from_millis(500),
            "node-a becomes leader of term 1",
        )
        .await?;

    for id in &ids {
        let metrics = router
            .wait_for_metrics(
                id,
                |m| m.current_leader.as_deref() == Some("node-a") && m.current_term == 1,
                Duration::from_millis(500),
                "every node learns the leader",
            )
            .await?;
        assert_eq!(metrics.current_term, 1);
    }

    let status = router.node("node-b").await.status();
    assert_eq!(status.leader.as_deref(), Some("node-a"));
    assert_eq!(status.term, 1);
    assert_eq!(status.peers.len(), 3);
    Ok(())
}

/// Minority partition safety.
///
/// A five node cluster is split 2/3 with the sitting leader in the minority.
/// The majority must elect a fresh leader and keep servicing writes; writes
/// to the minority must fail; on heal the minority catches up without losing
/// or contradicting any committed entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn minority_partition_safety() -> Result<()> {
    fixtures::init_tracing();

    let ids = ["n1", "n2", "n3", "n4", "n5"];
    let config = fixtures::cluster_config("partition", &ids);
    let router = ClusterRouter::new();
    for id in &ids {
        router.new_node(id, config.clone()).await;
    }

    let old_leader = router.wait_for_leader(Duration::from_secs(3)).await?;

    // Commit something before the partition.
    let leader_node = router.node(&old_leader).await;
    leader_node.lock_acquire("pre-partition", "writer", LockMode::Exclusive, Duration::from_secs(1)).await?;

    // Partition the leader plus one follower away from the other three.
    let buddy = ids.iter().find(|id| **id != old_leader).expect("another node exists").to_string();
    router.isolate_node(&old_leader).await;
    router.isolate_node(&buddy).await;

    // The majority elects a new leader in a higher term.
    let new_leader = router.wait_for_leader(Duration::from_secs(5)).await?;
    assert_ne!(new_leader, old_leader);
    assert_ne!(new_leader, buddy);

    // Writes on the majority keep working.
    let majority_node = router.node(&new_leader).await;
    majority_node.lock_acquire("during-partition", "writer", LockMode::Exclusive, Duration::from_secs(1)).await?;

    // Writes into the minority fail: the stale leader can not commit, and its
    // follower can only forward into the same dead end.
    let minority_node = router.node(&old_leader).await;
    let res = minority_node.lock_acquire("minority-write", "writer", LockMode::Exclusive, Duration::from_millis(300)).await;
    assert!(
        matches!(
            res,
            Err(ClusterError::Timeout) | Err(ClusterError::LeaderUnknown) | Err(ClusterError::NotLeader { .. })
        ),
        "unexpected result: {:?}",
        res
    );

    // Heal. The minority steps down to the higher term and catches up.
    router.restore_node(&old_leader).await;
    router.restore_node(&buddy).await;

    let majority_metrics = router
        .wait_for_metrics(&new_leader, |m| m.state == State::Leader, Duration::from_secs(3), "leader stays")
        .await?;
    let want = majority_metrics.last_applied;
    router.wait_for_log(&[&old_leader, &buddy], want, Duration::from_secs(5), "minority catches up").await?;

    // No committed entry was lost: the pre-partition lock is still held, so a
    // conflicting acquire must queue (and time out) rather than be granted.
    let healed = router.node(&old_leader).await;
    let res = healed.lock_acquire("pre-partition", "intruder", LockMode::Exclusive, Duration::from_millis(200)).await;
    assert!(matches!(res, Err(ClusterError::Timeout)), "unexpected result: {:?}", res);

    // And the majority-era write survives on the healed nodes too.
    let res = healed.lock_acquire("during-partition", "intruder", LockMode::Exclusive, Duration::from_millis(200)).await;
    assert!(matches!(res, Err(ClusterError::Timeout)), "unexpected result: {:?}", res);
    Ok(())
}

/// At most one leader per term, observed over a series of forced elections.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn election_safety_across_reelections() -> Result<()> {
    fixtures::init_tracing();

    let ids = ["n1", "n2", "n3"];
    let config = fixtures::cluster_config("reelect", &ids);
    let router = ClusterRouter::new();
    for id in &ids {
        router.new_node(id, config.clone()).await;
    }

    let mut leaders_by_term: BTreeMap<u64, String> = btreemap! {};
    for _ in 0..3 {
        let leader = router.wait_for_leader(Duration::from_secs(3)).await?;
        let metrics = router.node(&leader).await.metrics().borrow().clone();
        if let Some(previous) = leaders_by_term.insert(metrics.current_term, leader.clone()) {
            assert_eq!(previous, leader, "two leaders observed in term {}", metrics.current_term);
        }

        // Force a re-election by isolating the current leader.
        router.isolate_node(&leader).await;
        let next = router.wait_for_leader(Duration::from_secs(5)).await?;
        assert_ne!(next, leader);
        router.restore_node(&leader).await;
        router
            .wait_for_metrics(&leader, |m| m.state == State::Follower, Duration::from_secs(3), "old leader steps down")
            .await?;
    }
    Ok(())
}
