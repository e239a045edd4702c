mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conclave::ClusterError;
use conclave::Config;
use conclave::KvSink;
use conclave::uuid::Uuid;
use fixtures::ClusterRouter;
use fixtures::TestNode;
use tokio::time::sleep;

async fn cluster(router: &Arc<ClusterRouter>, cluster: &str, max_retries: u32) -> Vec<Arc<TestNode>> {
    let ids = ["n1", "n2", "n3"];
    let members = ids.iter().map(|id| (id.to_string(), format!("local://{}", id))).collect();
    let config = Arc::new(
        Config::build(cluster.into())
            .members(members)
            .queue_max_retries(max_retries)
            .validate()
            .expect("failed to build config"),
    );
    let mut nodes = Vec::new();
    for id in &ids {
        nodes.push(router.new_node(id, config.clone()).await);
    }
    router.wait_for_leader(Duration::from_secs(3)).await.expect("leader elected");
    nodes
}

/// Enqueue and dequeue work from any node; the operations are routed through
/// the partition primary transparently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn enqueue_and_dequeue_from_any_node() -> Result<()> {
    fixtures::init_tracing();
    let router = ClusterRouter::new();
    let nodes = cluster(&router, "queue-routing", 5).await;

    let id1 = nodes[0].queue_enqueue("jobs", b"first".to_vec()).await?;
    let id2 = nodes[1].queue_enqueue("jobs", b"second".to_vec()).await?;
    assert_ne!(id1, id2);

    // FIFO within the partition, regardless of which node serves the consumer.
    let d1 = nodes[2].queue_dequeue("jobs", "worker", None).await?.expect("first delivery");
    assert_eq!(d1.message_id, id1);
    assert_eq!(d1.payload, b"first".to_vec());
    assert_eq!(d1.attempts, 1);

    let d2 = nodes[0].queue_dequeue("jobs", "worker", None).await?.expect("second delivery");
    assert_eq!(d2.message_id, id2);

    nodes[1].queue_ack(d1.message_id).await?;
    nodes[1].queue_ack(d2.message_id).await?;
    // Give the partition primary time to apply the acks before re-checking.
    sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].queue_dequeue("jobs", "worker", None).await?.is_none());
    Ok(())
}

/// Queue at-least-once under consumer crash.
///
/// A message dequeued with a short visibility timeout and never acked must be
/// redelivered to another consumer with `attempts = 2`; after the ack a third
/// dequeue returns nothing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redelivery_after_visibility_expiry() -> Result<()> {
    fixtures::init_tracing();
    let router = ClusterRouter::new();
    let nodes = cluster(&router, "queue-redelivery", 5).await;

    let id = nodes[0].queue_enqueue("q", b"payload".to_vec()).await?;

    // Consumer c1 takes the message and disappears without acking.
    let d1 = nodes[0]
        .queue_dequeue("q", "c1", Some(Duration::from_millis(500)))
        .await?
        .expect("first delivery");
    assert_eq!(d1.message_id, id);
    assert_eq!(d1.attempts, 1);

    // While hidden, the queue looks empty.
    assert!(nodes[1].queue_dequeue("q", "c2", None).await?.is_none());

    // After expiry the sweeper returns it and c2 receives the same message.
    sleep(Duration::from_millis(900)).await;
    let d2 = nodes[1]
        .queue_dequeue("q", "c2", Some(Duration::from_secs(5)))
        .await?
        .expect("redelivery");
    assert_eq!(d2.message_id, id);
    assert_eq!(d2.payload, b"payload".to_vec());
    assert_eq!(d2.attempts, 2);

    nodes[1].queue_ack(id).await?;
    sleep(Duration::from_millis(200)).await;
    assert!(nodes[2].queue_dequeue("q", "c3", None).await?.is_none());
    Ok(())
}

/// A message exceeding its retry budget lands in the dead-letter queue and is
/// not delivered from the normal queue again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_move_message_to_dlq() -> Result<()> {
    fixtures::init_tracing();
    let router = ClusterRouter::new();
    let nodes = cluster(&router, "queue-dlq", 1).await;

    let id = nodes[0].queue_enqueue("q", b"poison".to_vec()).await?;

    // One delivery, never acked. With a budget of one delivery the sweeper
    // must dead-letter instead of returning it.
    let d1 = nodes[0]
        .queue_dequeue("q", "c1", Some(Duration::from_millis(300)))
        .await?
        .expect("delivery");
    assert_eq!(d1.attempts, 1);

    sleep(Duration::from_millis(800)).await;
    assert!(nodes[0].queue_dequeue("q", "c2", None).await?.is_none(), "dead message must not redeliver");

    // The DLQ serves it for inspection; acking removes it permanently.
    let dead = nodes[1].queue_dequeue("q::dlq", "operator", None).await?.expect("message in DLQ");
    assert_eq!(dead.message_id, id);
    assert_eq!(dead.payload, b"poison".to_vec());

    nodes[1].queue_ack(id).await?;
    sleep(Duration::from_millis(200)).await;
    assert!(nodes[2].queue_dequeue("q::dlq", "operator", None).await?.is_none());
    Ok(())
}

/// Acks of unknown messages are permanent errors; direct enqueues to a DLQ
/// name are rejected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ack_unknown_and_dlq_enqueue_rejection() -> Result<()> {
    fixtures::init_tracing();
    let router = ClusterRouter::new();
    let nodes = cluster(&router, "queue-errors", 5).await;

    let bogus = Uuid::new_v4();
    let res = nodes[0].queue_ack(bogus).await;
    assert!(
        matches!(res, Err(ClusterError::UnknownMessage(id)) if id == bogus),
        "unexpected result: {:?}",
        res
    );

    let res = nodes[0].queue_enqueue("q::dlq", b"sneaky".to_vec()).await;
    assert!(matches!(res, Err(ClusterError::Denied(_))), "unexpected result: {:?}", res);
    Ok(())
}

/// Enqueued messages are written to the persistent sink and removed on ack.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn durable_records_follow_message_lifecycle() -> Result<()> {
    fixtures::init_tracing();
    let router = ClusterRouter::new();
    let nodes = cluster(&router, "queue-durability", 5).await;

    let id = nodes[0].queue_enqueue("q", b"keep-me".to_vec()).await?;
    sleep(Duration::from_millis(300)).await;

    let key = format!("queue/msg/{}", id);
    for node_id in ["n1", "n2", "n3"] {
        let sink = router.sink(node_id).await;
        assert!(sink.get(&key).await?.is_some(), "missing durable record on {}", node_id);
    }

    let delivery = nodes[1].queue_dequeue("q", "c1", None).await?.expect("delivery");
    nodes[1].queue_ack(delivery.message_id).await?;
    sleep(Duration::from_millis(300)).await;

    for node_id in ["n1", "n2", "n3"] {
        let sink = router.sink(node_id).await;
        assert!(sink.get(&key).await?.is_none(), "stale durable record on {}", node_id);
    }
    Ok(())
}
