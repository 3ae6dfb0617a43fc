mod client;
mod count;
mod detail;
mod discovery;
mod error;
mod offsets;

pub(crate) use client::extract_offset;
pub use client::{
    BrokerClient, BrokerConnector, BrokerEndpoint, Offset, OffsetMap, PartitionIndex,
    RdKafkaConnector, TopicMetadata, TopicName,
};
pub use count::{aggregate_topic, count_messages};
pub use detail::{
    canned_partitions, CannedDetailSource, CannedPartition, DetailSource, LiveDetailSource,
    PartitionDetail, PartitionDetailView, PartitionSnapshot, CANNED_BROKER,
};
pub use discovery::{
    DiscoveryFailure, DiscoveryOutcome, MessageTotal, PendingTopic, TopicDescriptor,
    TopicDiscovery, TopicListing, TopicSnapshot, DEFAULT_DISCOVERY_TIMEOUT,
};
pub use error::{CensusError, CensusResult};
pub use offsets::OffsetFetcher;
