use crate::{
    conf::DetailConfig,
    kafka::{count_messages, CensusResult, Offset, OffsetFetcher, PartitionIndex},
    utils::o11y::logging::log_error,
};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

/// Broker address reported by the canned partition data.
pub const CANNED_BROKER: &str = "test.data:9092";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSnapshot {
    pub highwater_offset: Offset,
    pub message_count: i64,
}

/// One entry of the fixed dataset served by `CannedDetailSource`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CannedPartition {
    pub partition: PartitionIndex,
    pub broker: String,
    pub current_offset: Offset,
    pub msg_count: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PartitionDetail {
    Live(PartitionSnapshot),
    Canned(Vec<CannedPartition>),
}

/// Where partition details come from.
#[async_trait::async_trait]
pub trait DetailSource: Send + Sync {
    async fn detail(&self, topic: &str, partition: PartitionIndex) -> CensusResult<PartitionDetail>;
}

/// Reads the highwater offset and message count from the broker.
pub struct LiveDetailSource {
    fetcher: OffsetFetcher,
}

impl LiveDetailSource {
    pub fn new(fetcher: OffsetFetcher) -> Self {
        LiveDetailSource { fetcher }
    }
}

#[async_trait::async_trait]
impl DetailSource for LiveDetailSource {
    #[instrument(skip(self), err)]
    async fn detail(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<PartitionDetail> {
        let (highwater_offset, message_count) = tokio::try_join!(
            self.fetcher.fetch_latest(topic, partition),
            count_messages(&self.fetcher, topic, partition)
        )?;
        Ok(PartitionDetail::Live(PartitionSnapshot {
            highwater_offset,
            message_count,
        }))
    }
}

/// Test double for exercising a display without a live broker.
///
/// Requests for `stub_topic` are answered with three canned partitions and
/// never reach the broker; every other topic goes to the wrapped source.
pub struct CannedDetailSource<S> {
    stub_topic: String,
    inner: S,
}

impl<S: DetailSource> CannedDetailSource<S> {
    pub fn new(stub_topic: &str, inner: S) -> Self {
        CannedDetailSource {
            stub_topic: stub_topic.to_string(),
            inner,
        }
    }
}

#[async_trait::async_trait]
impl<S: DetailSource> DetailSource for CannedDetailSource<S> {
    async fn detail(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<PartitionDetail> {
        if topic == self.stub_topic {
            info!(?topic, "serving canned partition data");
            return Ok(PartitionDetail::Canned(canned_partitions()));
        }
        self.inner.detail(topic, partition).await
    }
}

pub fn canned_partitions() -> Vec<CannedPartition> {
    (1..=3)
        .map(|partition| CannedPartition {
            partition,
            broker: CANNED_BROKER.to_string(),
            current_offset: 99999,
            msg_count: 99999,
        })
        .collect()
}

/// Focused view of a single partition.
pub struct PartitionDetailView {
    source: Box<dyn DetailSource>,
}

impl PartitionDetailView {
    pub fn new(source: Box<dyn DetailSource>) -> Self {
        PartitionDetailView { source }
    }

    pub fn live(fetcher: OffsetFetcher) -> Self {
        Self::new(Box::new(LiveDetailSource::new(fetcher)))
    }

    /// Live view, wrapped in the canned double when `detail.stub_topic` is set.
    pub fn from_config(fetcher: OffsetFetcher, config: &DetailConfig) -> Self {
        let live = LiveDetailSource::new(fetcher);
        match &config.stub_topic {
            Some(stub_topic) => {
                warn!(%stub_topic, "partition detail stub enabled");
                Self::new(Box::new(CannedDetailSource::new(stub_topic, live)))
            }
            None => Self::new(Box::new(live)),
        }
    }

    pub async fn detail(
        &self,
        topic: &str,
        partition: PartitionIndex,
    ) -> CensusResult<PartitionDetail> {
        self.source.detail(topic, partition).await
    }

    /// Fetch the detail and push the result, success or error, on the channel.
    pub async fn deliver(
        &self,
        topic: &str,
        partition: PartitionIndex,
        sender: mpsc::Sender<CensusResult<PartitionDetail>>,
    ) {
        let result = self
            .detail(topic, partition)
            .await
            .inspect_err(|error| log_error!(error, "failed to read partition detail"));
        if sender.send(result).await.is_err() {
            warn!("partition detail receiver dropped before delivery");
        }
    }
}
