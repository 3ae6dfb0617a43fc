use crate::kafka::{CensusError, CensusResult};

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use rdkafka::{
    config::ClientConfig,
    consumer::{BaseConsumer, Consumer},
    error::{KafkaError, KafkaResult, RDKafkaErrorCode},
    metadata::Metadata,
    Offset as KafkaOffset, TopicPartitionList,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub type TopicName = String;
pub type PartitionIndex = i32;
pub type Offset = i64;

/// Offsets keyed by topic, then by partition.
pub type OffsetMap = HashMap<TopicName, HashMap<PartitionIndex, Offset>>;

/// Connection descriptor for a Kafka cluster.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    servers: Vec<String>,
    credentials: Option<(String, String)>,
}

impl BrokerEndpoint {
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BrokerEndpoint {
            servers: servers.into_iter().map(Into::into).collect(),
            credentials: None,
        }
    }

    /// Authenticate with SASL/SCRAM using the given username and password.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// The servers joined in the form expected by `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        self.servers.join(",")
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        self.credentials
            .as_ref()
            .map(|(username, password)| (username.as_str(), password.as_str()))
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bootstrap_servers())
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("servers", &self.servers)
            .field(
                "username",
                &self.credentials.as_ref().map(|(username, _)| username),
            )
            .finish()
    }
}

/// A topic as listed by the broker, with the ids of its partitions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMetadata {
    pub name: TopicName,
    pub partitions: Vec<PartitionIndex>,
}

impl TopicMetadata {
    pub fn new(name: &str, partitions: Vec<PartitionIndex>) -> Self {
        TopicMetadata {
            name: name.to_string(),
            partitions,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Kafka reserves the double underscore prefix for its own topics
    /// (`__consumer_offsets`, `__transaction_state`, ...).
    pub fn is_internal(&self) -> bool {
        self.name.starts_with("__")
    }
}

/// The broker operations the offset engine relies on.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn list_topics(&self) -> CensusResult<Vec<TopicMetadata>>;
    async fn fetch_earliest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap>;
    async fn fetch_latest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap>;

    /// Earliest offset of a single partition. The default answers from the
    /// topic-wide request.
    async fn fetch_earliest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        let offsets = self.fetch_earliest_offsets(&[topic.to_string()]).await?;
        extract_offset(&offsets, topic, partition)
    }

    /// Latest offset of a single partition. The default answers from the
    /// topic-wide request.
    async fn fetch_latest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        let offsets = self.fetch_latest_offsets(&[topic.to_string()]).await?;
        extract_offset(&offsets, topic, partition)
    }
}

/// The offset of `topic`/`partition`, or a protocol error when the broker
/// response left it out.
pub(crate) fn extract_offset(
    offsets: &OffsetMap,
    topic: &str,
    partition: PartitionIndex,
) -> CensusResult<Offset> {
    offsets
        .get(topic)
        .and_then(|partitions| partitions.get(&partition))
        .copied()
        .ok_or_else(|| CensusError::protocol(topic, partition))
}

/// Opens broker clients. Every call yields a fresh client that is dropped,
/// and its connection closed, once the caller is done with it.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> CensusResult<Box<dyn BrokerClient>>;
}

/// Connector backed by librdkafka.
#[derive(Clone, Debug)]
pub struct RdKafkaConnector {
    request_timeout: Duration,
}

impl RdKafkaConnector {
    pub fn new(request_timeout: Duration) -> Self {
        RdKafkaConnector { request_timeout }
    }

    fn client_config(endpoint: &BrokerEndpoint) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            // Uncomment the following to get logs from kafka (RUST_LOG doesn't work):
            // .set("debug", "broker,topic,metadata")
            .set("bootstrap.servers", endpoint.bootstrap_servers())
            .set("client.id", format!("census-{}", Uuid::new_v4()))
            .set("allow.auto.create.topics", "false");

        if let Some((username, password)) = endpoint.credentials() {
            client_config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanisms", "SCRAM-SHA-512")
                .set("sasl.username", username)
                .set("sasl.password", password);
        } else {
            client_config.set("security.protocol", "PLAINTEXT");
        }
        client_config
    }
}

#[async_trait::async_trait]
impl BrokerConnector for RdKafkaConnector {
    #[instrument(skip(self), err)]
    async fn connect(&self, endpoint: &BrokerEndpoint) -> CensusResult<Box<dyn BrokerClient>> {
        let consumer: BaseConsumer = Self::client_config(endpoint)
            .create()
            .map_err(|error| CensusError::connection(endpoint, error))?;
        Ok(Box::new(RdKafkaClient {
            consumer: Arc::new(consumer),
            endpoint: endpoint.to_string(),
            timeout: self.request_timeout,
        }))
    }
}

struct RdKafkaClient {
    consumer: Arc<BaseConsumer>,
    endpoint: String,
    timeout: Duration,
}

impl RdKafkaClient {
    // librdkafka calls block, so they are moved off the async workers.
    async fn blocking<T, F>(&self, call: F) -> CensusResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&BaseConsumer, &str, Duration) -> CensusResult<T> + Send + 'static,
    {
        let consumer = Arc::clone(&self.consumer);
        let endpoint = self.endpoint.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || call(&consumer, &endpoint, timeout)).await?
    }

    // One metadata request per topic for its partition ids, then a single
    // ListOffsets request covering all of them.
    async fn topic_offsets(
        &self,
        topics: &[TopicName],
        position: KafkaOffset,
    ) -> CensusResult<OffsetMap> {
        let topics = topics.to_vec();
        self.blocking(move |consumer, endpoint, timeout| {
            let mut listed = Vec::with_capacity(topics.len());
            for topic in &topics {
                let metadata = consumer
                    .fetch_metadata(Some(topic.as_str()), timeout)
                    .map_err(|error| CensusError::connection(endpoint, error))?;
                listed.extend(
                    parse_topics(&metadata)
                        .into_iter()
                        .filter(|listed_topic| &listed_topic.name == topic),
                );
            }
            query_offsets(consumer, endpoint, &listed, position, timeout)
        })
        .await
    }

    // A ListOffsets request for one partition, without a metadata lookup.
    async fn partition_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
        position: KafkaOffset,
    ) -> CensusResult<Offset> {
        let listed = [TopicMetadata::new(topic, vec![partition])];
        let offsets = self
            .blocking(move |consumer, endpoint, timeout| {
                query_offsets(consumer, endpoint, &listed, position, timeout)
            })
            .await?;
        extract_offset(&offsets, topic, partition)
    }
}

#[async_trait::async_trait]
impl BrokerClient for RdKafkaClient {
    #[instrument(skip_all, err)]
    async fn list_topics(&self) -> CensusResult<Vec<TopicMetadata>> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| parse_topics(&metadata))
        })
        .await?
        .map_err(|error| CensusError::connection(&self.endpoint, error))
    }

    #[instrument(skip(self), err)]
    async fn fetch_earliest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap> {
        self.topic_offsets(topics, KafkaOffset::Beginning).await
    }

    #[instrument(skip(self), err)]
    async fn fetch_latest_offsets(&self, topics: &[TopicName]) -> CensusResult<OffsetMap> {
        self.topic_offsets(topics, KafkaOffset::End).await
    }

    #[instrument(skip(self), err)]
    async fn fetch_earliest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        self.partition_offset(topic, partition, KafkaOffset::Beginning).await
    }

    #[instrument(skip(self), err)]
    async fn fetch_latest_offset(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        self.partition_offset(topic, partition, KafkaOffset::End).await
    }
}

// rdkafka's Metadata hands out references into librdkafka-owned memory, so the
// listing is copied into owned TopicMetadata values right away.
fn parse_topics(metadata: &Metadata) -> Vec<TopicMetadata> {
    metadata
        .topics()
        .iter()
        .filter_map(|topic| {
            if let Some(error) = topic.error() {
                warn!(
                    topic = topic.name(),
                    error = ?RDKafkaErrorCode::from(error),
                    "skipping topic with metadata error"
                );
                return None;
            }
            let partitions = topic
                .partitions()
                .iter()
                .map(|partition| partition.id())
                .collect();
            Some(TopicMetadata::new(topic.name(), partitions))
        })
        .collect()
}

// Resolves `position` (earliest or latest) for every listed partition in one
// ListOffsets round trip. Partitions the broker does not know are left out of
// the map.
fn query_offsets(
    consumer: &BaseConsumer,
    endpoint: &str,
    listed: &[TopicMetadata],
    position: KafkaOffset,
    timeout: Duration,
) -> CensusResult<OffsetMap> {
    let request = offset_request(listed, position)
        .map_err(|error| CensusError::connection(endpoint, error))?;
    if request.count() == 0 {
        return Ok(OffsetMap::new());
    }

    let response = consumer
        .offsets_for_times(request, timeout)
        .map_err(|error| CensusError::connection(endpoint, error))?;
    let mut offsets = OffsetMap::with_capacity(listed.len());
    for entry in response.elements() {
        let (topic, partition) = (entry.topic(), entry.partition());
        match (entry.error(), entry.offset()) {
            (Err(error), _) if is_unknown_topic_or_partition(&error) => {
                debug!(?topic, ?partition, "partition unknown to broker");
            }
            (Err(error), _) => return Err(CensusError::connection(endpoint, error)),
            (Ok(()), KafkaOffset::Offset(offset)) => {
                debug!(?topic, ?partition, ?offset, ?position, "offset resolved");
                offsets
                    .entry(topic.to_string())
                    .or_default()
                    .insert(partition, offset);
            }
            (Ok(()), unresolved) => {
                debug!(?topic, ?partition, ?unresolved, "broker returned no offset");
            }
        }
    }
    Ok(offsets)
}

/// A ListOffsets request asking for `position` on every listed partition.
fn offset_request(
    topics: &[TopicMetadata],
    position: KafkaOffset,
) -> KafkaResult<TopicPartitionList> {
    let mut request = TopicPartitionList::new();
    for topic in topics {
        for &partition in &topic.partitions {
            request.add_partition_offset(&topic.name, partition, position)?;
        }
    }
    Ok(request)
}

fn is_unknown_topic_or_partition(error: &KafkaError) -> bool {
    matches!(
        error.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::UnknownPartition
                | RDKafkaErrorCode::UnknownTopic
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_servers_are_comma_separated() {
        let endpoint = BrokerEndpoint::new(["kafka-1:9092", "kafka-2:9092"]);
        assert_eq!(endpoint.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(endpoint.to_string(), "kafka-1:9092,kafka-2:9092");
    }

    #[test]
    fn debug_output_hides_password() {
        let endpoint =
            BrokerEndpoint::new(["localhost:9092"]).with_credentials("reader", "hunter2");
        let debug = format!("{:?}", endpoint);
        assert!(debug.contains("reader"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn sasl_is_configured_only_with_credentials() {
        let plain = RdKafkaConnector::client_config(&BrokerEndpoint::new(["localhost:9092"]));
        assert_eq!(plain.get("security.protocol"), Some("PLAINTEXT"));
        assert_eq!(plain.get("sasl.username"), None);

        let endpoint = BrokerEndpoint::new(["localhost:9093"]).with_credentials("reader", "secret");
        let sasl = RdKafkaConnector::client_config(&endpoint);
        assert_eq!(sasl.get("security.protocol"), Some("SASL_PLAINTEXT"));
        assert_eq!(sasl.get("sasl.mechanisms"), Some("SCRAM-SHA-512"));
        assert_eq!(sasl.get("sasl.username"), Some("reader"));
        assert_eq!(sasl.get("bootstrap.servers"), Some("localhost:9093"));
    }

    #[test]
    fn every_client_gets_its_own_id() {
        let endpoint = BrokerEndpoint::new(["localhost:9092"]);
        let first = RdKafkaConnector::client_config(&endpoint);
        let second = RdKafkaConnector::client_config(&endpoint);
        assert_ne!(first.get("client.id"), second.get("client.id"));
    }

    #[test]
    fn one_request_covers_every_partition() {
        let topics = [
            TopicMetadata::new("orders", vec![0, 1, 2]),
            TopicMetadata::new("payments", vec![0]),
        ];
        let request = offset_request(&topics, KafkaOffset::End).unwrap();
        assert_eq!(request.count(), 4);
        assert!(request
            .elements()
            .iter()
            .all(|entry| entry.offset() == KafkaOffset::End));
        assert_eq!(request.elements_for_topic("orders").len(), 3);

        let earliest = offset_request(&topics[..1], KafkaOffset::Beginning).unwrap();
        assert!(earliest
            .elements()
            .iter()
            .all(|entry| entry.offset() == KafkaOffset::Beginning));
    }

    #[test]
    fn no_partitions_make_an_empty_request() {
        let topics = [TopicMetadata::new("empty", vec![])];
        assert_eq!(offset_request(&topics, KafkaOffset::End).unwrap().count(), 0);
    }

    #[test]
    fn internal_topics_are_recognized() {
        assert!(TopicMetadata::new("__consumer_offsets", vec![0]).is_internal());
        assert!(!TopicMetadata::new("orders", vec![0, 1]).is_internal());
        assert_eq!(TopicMetadata::new("orders", vec![0, 1]).partition_count(), 2);
    }
}
