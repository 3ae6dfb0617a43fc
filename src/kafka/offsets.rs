use crate::kafka::{
    BrokerClient, BrokerConnector, BrokerEndpoint, CensusResult, Offset, PartitionIndex,
};

use std::sync::Arc;

use tracing::instrument;

/// Point queries for the earliest (oldest retained) and latest (highwater)
/// offset of a single partition.
///
/// Each query opens its own broker client through the connector, so clones of
/// the fetcher can be moved into concurrent tasks without sharing any client
/// state.
#[derive(Clone)]
pub struct OffsetFetcher {
    connector: Arc<dyn BrokerConnector>,
    endpoint: Arc<BrokerEndpoint>,
}

impl OffsetFetcher {
    pub fn new(connector: Arc<dyn BrokerConnector>, endpoint: BrokerEndpoint) -> Self {
        OffsetFetcher {
            connector,
            endpoint: Arc::new(endpoint),
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub(crate) async fn connect(&self) -> CensusResult<Box<dyn BrokerClient>> {
        self.connector.connect(&self.endpoint).await
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_earliest(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        let client = self.connect().await?;
        client.fetch_earliest_offset(topic, partition).await
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_latest(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<Offset> {
        let client = self.connect().await?;
        client.fetch_latest_offset(topic, partition).await
    }
}
