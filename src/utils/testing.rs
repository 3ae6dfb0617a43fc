// Utilities for unit and integration tests
use crate::kafka::{
    extract_offset, BrokerClient, BrokerConnector, BrokerEndpoint, CensusError, CensusResult,
    Offset, OffsetFetcher, OffsetMap, PartitionIndex, TopicMetadata, TopicName,
};

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

pub const TEST_CONFIG_FILE: &str = "tests/config.test.yaml";

#[derive(Default)]
struct MockState {
    // (earliest, latest) per partition, indexed by partition id
    topics: BTreeMap<TopicName, Vec<(Offset, Offset)>>,
    listing_delay: Option<Duration>,
    unreachable: bool,
    failing_earliest: HashSet<TopicName>,
    failing_latest: HashSet<TopicName>,
    failing_partitions: HashSet<(TopicName, PartitionIndex)>,
}

/// In-memory stand-in for a Kafka cluster.
///
/// Implements `BrokerConnector`, so it can be handed to an `OffsetFetcher` in
/// place of the librdkafka connector. Clones share the same state and
/// counters.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
    connections: Arc<AtomicUsize>,
    listings_completed: Arc<AtomicUsize>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic whose partition `i` retains offsets `offsets[i]`, given as
    /// `(earliest, latest)`.
    pub fn with_topic(self, name: &str, offsets: &[(Offset, Offset)]) -> Self {
        self.update(|state| {
            state.topics.insert(name.to_string(), offsets.to_vec());
        })
    }

    /// Delay every topic listing by the given duration.
    pub fn with_listing_delay(self, delay: Duration) -> Self {
        self.update(|state| state.listing_delay = Some(delay))
    }

    /// Refuse every connection attempt.
    pub fn unreachable(self) -> Self {
        self.update(|state| state.unreachable = true)
    }

    /// Fail earliest-offset requests that include the given topic.
    pub fn fail_earliest_for(self, topic: &str) -> Self {
        self.update(|state| {
            state.failing_earliest.insert(topic.to_string());
        })
    }

    /// Fail latest-offset requests that include the given topic.
    pub fn fail_latest_for(self, topic: &str) -> Self {
        self.update(|state| {
            state.failing_latest.insert(topic.to_string());
        })
    }

    /// Fail both offset queries for one partition of a topic. Requests for
    /// the other partitions still succeed.
    pub fn fail_partition(self, topic: &str, partition: PartitionIndex) -> Self {
        self.update(|state| {
            state
                .failing_partitions
                .insert((topic.to_string(), partition));
        })
    }

    /// Number of clients opened so far, successful or not.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Number of topic listings that ran to completion.
    pub fn listings_completed(&self) -> usize {
        self.listings_completed.load(Ordering::SeqCst)
    }

    /// An `OffsetFetcher` wired to this broker.
    pub fn fetcher(&self) -> OffsetFetcher {
        OffsetFetcher::new(Arc::new(self.clone()), BrokerEndpoint::new(["mock:9092"]))
    }

    fn update(self, f: impl FnOnce(&mut MockState)) -> Self {
        f(&mut self.state.lock().expect("mock state poisoned"));
        self
    }
}

#[async_trait::async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> CensusResult<Box<dyn BrokerClient>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().expect("mock state poisoned").unreachable {
            return Err(CensusError::connection(endpoint, "connection refused"));
        }
        Ok(Box::new(MockClient {
            broker: self.clone(),
            endpoint: endpoint.to_string(),
        }))
    }
}

struct MockClient {
    broker: MockBroker,
    endpoint: String,
}

impl MockClient {
    fn check_partition(&self, topic: &str, partition: PartitionIndex) -> CensusResult<()> {
        let state = self.broker.state.lock().expect("mock state poisoned");
        if state
            .failing_partitions
            .contains(&(topic.to_string(), partition))
        {
            return Err(CensusError::connection(&self.endpoint, "connection reset by peer"));
        }
        Ok(())
    }

    fn offsets(
        &self,
        topics: &[TopicName],
        failing: fn(&MockState) -> &HashSet<TopicName>,
        pick: fn(&(Offset, Offset)) -> Offset,
    ) -> CensusResult<OffsetMap> {
        let state = self.broker.state.lock().expect("mock state poisoned");
        let mut offsets = OffsetMap::new();
        for topic in topics {
            if failing(&state).contains(topic) {
                return Err(CensusError::connection(&self.endpoint, "connection reset by peer"));
            }
            if let Some(partitions) = state.topics.get(topic) {
                let by_partition: HashMap<_, _> = partitions
                    .iter()
                    .enumerate()
                    .map(|(partition, pair)| (partition as PartitionIndex, pick(pair)))
                    .collect();
                offsets.insert(topic.clone(), by_partition);
            }
        }
        Ok(offsets)
    }
}

#[async_trait::async_trait]
impl BrokerClient for MockClient {
    async fn list_topics(&self) -> CensusResult<Vec<TopicMetadata>> {
        let delay = self.broker.state.lock().expect("mock state poisoned").listing_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let topics = self
            .broker
            .state
            .lock()
            .expect("mock state poisoned")
            .topics
            .iter()
            .map(|(name, partitions)| {
                TopicMetadata::new(name, (0..partitions.len() as PartitionIndex).collect())
            })
            .collect();
        self.broker.listings_completed.fetch_add(1, Ordering::SeqCst);
        Ok(topics)
    }

    async fn fetch_earliest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap> {
        self.offsets(topics, |state| &state.failing_earliest, |(earliest, _)| *earliest)
    }

    async fn fetch_latest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap> {
        self.offsets(topics, |state| &state.failing_latest, |(_, latest)| *latest)
    }

    async fn fetch_earliest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        self.check_partition(topic, partition)?;
        let offsets = self.fetch_earliest_offsets(&[topic.to_string()]).await?;
        extract_offset(&offsets, topic, partition)
    }

    async fn fetch_latest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        self.check_partition(topic, partition)?;
        let offsets = self.fetch_latest_offsets(&[topic.to_string()]).await?;
        extract_offset(&offsets, topic, partition)
    }
}
