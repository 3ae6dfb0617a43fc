//! End-to-end flows against the in-memory broker.

use census::conf::{CensusConfig, DetailConfig, DiscoveryConfig};
use census::kafka::{
    aggregate_topic, canned_partitions, CensusError, DiscoveryFailure, DiscoveryOutcome,
    MessageTotal, PartitionDetail, PartitionDetailView, TopicDiscovery,
};
use census::utils::testing::MockBroker;

use std::time::Duration;

use tokio::sync::mpsc;

fn cluster() -> MockBroker {
    MockBroker::new()
        .with_topic("orders", &[(100, 150), (200, 200), (50, 40)])
        .with_topic("payments", &[(0, 12), (3, 9)])
        .with_topic("audit", &[(0, 5)])
        .fail_latest_for("audit")
}

#[tokio::test]
async fn test_discovery_delivers_resolved_snapshot() {
    let broker = cluster();
    let (sender, mut receiver) = mpsc::channel(1);
    TopicDiscovery::new(broker.fetcher()).discover(sender).await;

    let Some(DiscoveryOutcome::Ready(snapshot)) = receiver.recv().await else {
        panic!("expected a snapshot");
    };
    let names: Vec<_> = snapshot.topics.iter().map(|t| t.topic.as_str()).collect();
    assert_eq!(names, ["audit", "orders", "payments"]);

    let orders = snapshot.get("orders").unwrap();
    assert_eq!(orders.partition_count, 3);
    assert_eq!(orders.messages, MessageTotal::Resolved(40));
    assert_eq!(snapshot.get("payments").unwrap().messages, MessageTotal::Resolved(18));
    assert!(matches!(
        snapshot.get("audit").unwrap().messages,
        MessageTotal::Failed(_)
    ));

    // exactly one delivery per discovery
    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_failing_partition_fails_only_its_topic() {
    let broker = cluster();
    let error = aggregate_topic(&broker.fetcher(), "audit", 1).await.unwrap_err();
    assert!(matches!(error, CensusError::Aggregation { ref topic, .. } if topic == "audit"));
    assert_eq!(aggregate_topic(&broker.fetcher(), "payments", 2).await.unwrap(), 18);
}

#[tokio::test]
async fn test_one_failing_partition_fails_its_topic_in_the_snapshot() {
    let broker = cluster()
        .with_topic("events", &[(0, 4), (0, 5), (0, 6)])
        .fail_partition("events", 1);
    let snapshot = TopicDiscovery::new(broker.fetcher())
        .list()
        .await
        .unwrap()
        .resolve()
        .await;

    match &snapshot.get("events").unwrap().messages {
        MessageTotal::Failed(message) => {
            assert!(message.contains("events"));
            assert!(message.contains("connection reset by peer"));
        }
        other => panic!("expected events to fail, got {:?}", other),
    }
    assert_eq!(snapshot.get("events").unwrap().partition_count, 3);
    assert_eq!(snapshot.get("orders").unwrap().messages, MessageTotal::Resolved(40));
}

#[tokio::test(start_paused = true)]
async fn test_configured_timeout_is_honored() {
    let broker = cluster().with_listing_delay(Duration::from_millis(800));
    let config = DiscoveryConfig {
        timeout_ms: 500,
        include_internal: true,
    };
    let discovery = TopicDiscovery::from_config(broker.fetcher(), &config);
    let (sender, mut receiver) = mpsc::channel(1);
    tokio::spawn(async move { discovery.discover(sender).await });

    let outcome = receiver.recv().await.unwrap();
    assert!(matches!(
        outcome,
        DiscoveryOutcome::Failed(DiscoveryFailure::TimedOut { timeout_ms: 500 })
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(broker.listings_completed(), 1);
    assert!(receiver.recv().await.is_none());
}

#[tokio::test]
async fn test_stub_topic_from_config() {
    let broker = MockBroker::new().unreachable();
    let mut config = CensusConfig::default();
    config.detail = DetailConfig {
        stub_topic: Some("asdf".to_string()),
    };
    let view = PartitionDetailView::from_config(broker.fetcher(), &config.detail);
    let (sender, mut receiver) = mpsc::channel(1);
    view.deliver("asdf", 0, sender).await;

    let detail = receiver.recv().await.unwrap().unwrap();
    assert_eq!(detail, PartitionDetail::Canned(canned_partitions()));
    assert_eq!(broker.connections(), 0);
}
