use crate::kafka::{CensusError, CensusResult, OffsetFetcher, PartitionIndex};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, instrument, warn};

/// Number of messages retained by one partition: latest minus earliest.
///
/// The two offsets are sampled independently, so retention can advance the
/// earliest offset past the sampled latest one. The raw difference is returned
/// in that case, negative values included.
#[instrument(skip(fetcher), err)]
pub async fn count_messages(
    fetcher: &OffsetFetcher,
    topic: &str,
    partition: PartitionIndex,
) -> CensusResult<i64> {
    let (earliest, latest) = tokio::try_join!(
        fetcher.fetch_earliest(topic, partition),
        fetcher.fetch_latest(topic, partition)
    )?;
    let count = latest - earliest;
    if count < 0 {
        warn!(
            ?topic,
            ?partition,
            ?earliest,
            ?latest,
            "latest offset sampled below earliest, reporting negative count"
        );
    } else {
        debug!(?topic, ?partition, ?earliest, ?latest, ?count, "partition count");
    }
    Ok(count)
}

/// Total number of messages retained across partitions `0..partition_count`.
///
/// Partitions are counted in concurrently spawned tasks. The first failure
/// fails the whole topic; sibling counts that are still in flight are left
/// to finish in the background and their results are dropped.
#[instrument(skip(fetcher), err)]
pub async fn aggregate_topic(
    fetcher: &OffsetFetcher,
    topic: &str,
    partition_count: usize,
) -> CensusResult<i64> {
    let mut counts: FuturesUnordered<_> = (0..partition_count)
        .map(|partition| {
            let fetcher = fetcher.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                count_messages(&fetcher, &topic, partition as PartitionIndex).await
            })
        })
        .collect();

    let mut total = 0i64;
    while let Some(joined) = counts.next().await {
        match joined.map_err(CensusError::from).and_then(|count| count) {
            Ok(count) => total += count,
            Err(error) => return Err(CensusError::aggregation(topic, error)),
        }
    }
    debug!(?topic, ?partition_count, ?total, "topic count");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kafka::BrokerEndpoint, utils::testing::MockBroker};

    use std::sync::Arc;

    fn fetcher(broker: &MockBroker) -> OffsetFetcher {
        OffsetFetcher::new(Arc::new(broker.clone()), BrokerEndpoint::new(["mock:9092"]))
    }

    #[tokio::test]
    async fn count_is_latest_minus_earliest() {
        let pairs = [(0, 0), (0, 1), (17, 42), (1_000_000, 1_000_000_007)];
        let broker = MockBroker::new().with_topic("events", &pairs);
        let fetcher = fetcher(&broker);

        for (partition, (earliest, latest)) in pairs.iter().enumerate() {
            let count = count_messages(&fetcher, "events", partition as PartitionIndex)
                .await
                .unwrap();
            assert_eq!(count, latest - earliest);
        }
    }

    #[tokio::test]
    async fn orders_scenario_passes_negative_counts_through() {
        let broker = MockBroker::new().with_topic("orders", &[(100, 150), (200, 200), (50, 40)]);
        let fetcher = fetcher(&broker);

        assert_eq!(count_messages(&fetcher, "orders", 0).await.unwrap(), 50);
        assert_eq!(count_messages(&fetcher, "orders", 1).await.unwrap(), 0);
        assert_eq!(count_messages(&fetcher, "orders", 2).await.unwrap(), -10);
        assert_eq!(aggregate_topic(&fetcher, "orders", 3).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn count_propagates_fetch_errors_unchanged() {
        let broker = MockBroker::new()
            .with_topic("orders", &[(0, 10)])
            .fail_latest_for("orders");
        let error = count_messages(&fetcher(&broker), "orders", 0).await.unwrap_err();
        assert!(matches!(error, CensusError::Connection { .. }));
    }

    #[tokio::test]
    async fn aggregate_sums_every_partition() {
        let pairs: Vec<(i64, i64)> = (0..12).map(|i| (i * 10, i * 25 + 3)).collect();
        let expected: i64 = pairs.iter().map(|(earliest, latest)| latest - earliest).sum();
        let broker = MockBroker::new().with_topic("clicks", &pairs);

        let total = aggregate_topic(&fetcher(&broker), "clicks", pairs.len()).await.unwrap();
        assert_eq!(total, expected);
        assert_eq!(broker.connections(), 2 * pairs.len());
    }

    #[tokio::test]
    async fn aggregate_of_no_partitions_is_zero() {
        let broker = MockBroker::new();
        assert_eq!(aggregate_topic(&fetcher(&broker), "empty", 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn aggregate_fails_without_partial_sum() {
        let broker = MockBroker::new()
            .with_topic("orders", &[(0, 10), (0, 20)])
            .fail_earliest_for("orders");
        let error = aggregate_topic(&fetcher(&broker), "orders", 2).await.unwrap_err();
        match error {
            CensusError::Aggregation { topic, source } => {
                assert_eq!(topic, "orders");
                assert!(matches!(*source, CensusError::Connection { .. }));
            }
            other => panic!("expected an aggregation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn one_unreachable_partition_fails_the_topic() {
        let broker = MockBroker::new()
            .with_topic("orders", &[(0, 10), (0, 20), (0, 30)])
            .fail_partition("orders", 1);
        let error = aggregate_topic(&fetcher(&broker), "orders", 3).await.unwrap_err();
        match error {
            CensusError::Aggregation { topic, source } => {
                assert_eq!(topic, "orders");
                assert!(matches!(*source, CensusError::Connection { .. }));
            }
            other => panic!("expected an aggregation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn aggregate_fails_when_a_partition_is_missing() {
        let broker = MockBroker::new().with_topic("orders", &[(0, 10), (0, 20)]);
        let error = aggregate_topic(&fetcher(&broker), "orders", 3).await.unwrap_err();
        match error {
            CensusError::Aggregation { source, .. } => {
                assert!(matches!(*source, CensusError::Protocol { partition: 2, .. }));
            }
            other => panic!("expected an aggregation error, got {:?}", other),
        }
    }
}
