use std::{fmt::Display, time::Duration};

use crate::kafka::PartitionIndex;

pub type CensusResult<T> = Result<T, CensusError>;

/// Errors raised while querying a broker for offsets and topic listings.
#[derive(Debug, thiserror::Error)]
pub enum CensusError {
    #[error("broker {endpoint} unreachable: {reason}")]
    Connection { endpoint: String, reason: String },
    #[error("topic {topic} partition {partition} missing from broker response")]
    Protocol {
        topic: String,
        partition: PartitionIndex,
    },
    #[error("topic listing did not complete within {0:?}")]
    Timeout(Duration),
    #[error("failed to count messages for topic {topic}: {source}")]
    Aggregation {
        topic: String,
        #[source]
        source: Box<CensusError>,
    },
    #[error("broker task did not run to completion")]
    Task(#[from] tokio::task::JoinError),
}

impl CensusError {
    pub fn connection(endpoint: impl Display, reason: impl Display) -> Self {
        CensusError::Connection {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(topic: &str, partition: PartitionIndex) -> Self {
        CensusError::Protocol {
            topic: topic.to_string(),
            partition,
        }
    }

    pub fn aggregation(topic: &str, source: CensusError) -> Self {
        CensusError::Aggregation {
            topic: topic.to_string(),
            source: Box::new(source),
        }
    }
}
