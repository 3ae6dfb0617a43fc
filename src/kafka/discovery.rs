use crate::{
    conf::DiscoveryConfig,
    kafka::{aggregate_topic, CensusError, CensusResult, OffsetFetcher, TopicMetadata, TopicName},
    utils::o11y::logging::log_error,
};

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{
    future::join_all,
    stream::{FuturesUnordered, Stream},
};
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

/// Time allowed for the topic listing before discovery gives up.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);

/// The message total of one topic, once its aggregation has finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum MessageTotal {
    Resolved(i64),
    Failed(String),
}

impl MessageTotal {
    pub fn resolved(&self) -> Option<i64> {
        match self {
            MessageTotal::Resolved(total) => Some(*total),
            MessageTotal::Failed(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDescriptor {
    pub topic: TopicName,
    pub partition_count: usize,
    pub messages: MessageTotal,
}

/// Every listed topic with its resolved message total, ordered by topic name.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub topics: Vec<TopicDescriptor>,
}

impl TopicSnapshot {
    pub fn get(&self, topic: &str) -> Option<&TopicDescriptor> {
        self.topics.iter().find(|descriptor| descriptor.topic == topic)
    }
}

/// Why discovery could not produce a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum DiscoveryFailure {
    TimedOut {
        #[serde(rename = "timeoutMs")]
        timeout_ms: u64,
    },
    Listing {
        message: String,
    },
}

/// The single message delivered for each discovery run.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "camelCase")]
pub enum DiscoveryOutcome {
    Ready(TopicSnapshot),
    Failed(DiscoveryFailure),
}

/// A listed topic whose aggregation is running in its own task.
pub struct PendingTopic {
    topic: TopicName,
    partition_count: usize,
    messages: JoinHandle<CensusResult<i64>>,
}

impl PendingTopic {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Wait for this topic's aggregation. A failure only affects this topic.
    pub async fn resolve(self) -> TopicDescriptor {
        let messages = match self.messages.await.map_err(CensusError::from) {
            Ok(Ok(total)) => MessageTotal::Resolved(total),
            Ok(Err(error)) | Err(error) => {
                log_error!(error, topic = %self.topic, "topic aggregation failed");
                MessageTotal::Failed(error.to_string())
            }
        };
        TopicDescriptor {
            topic: self.topic,
            partition_count: self.partition_count,
            messages,
        }
    }
}

/// The outcome of a successful listing: topics and partition counts are known,
/// message totals are still resolving.
pub struct TopicListing {
    topics: Vec<PendingTopic>,
}

impl TopicListing {
    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn pending(&self) -> &[PendingTopic] {
        &self.topics
    }

    /// Wait until every topic has resolved, successfully or not.
    pub async fn resolve(self) -> TopicSnapshot {
        let topics = join_all(self.topics.into_iter().map(PendingTopic::resolve)).await;
        TopicSnapshot {
            sampled_at: Utc::now(),
            topics,
        }
    }

    /// Yield each topic as soon as its total resolves, in completion order.
    pub fn into_updates(self) -> impl Stream<Item = TopicDescriptor> + Send {
        self.topics
            .into_iter()
            .map(PendingTopic::resolve)
            .collect::<FuturesUnordered<_>>()
    }
}

/// Lists every topic of the cluster and counts the messages each one retains.
#[derive(Clone)]
pub struct TopicDiscovery {
    fetcher: OffsetFetcher,
    timeout: Duration,
    include_internal: bool,
}

impl TopicDiscovery {
    pub fn new(fetcher: OffsetFetcher) -> Self {
        TopicDiscovery {
            fetcher,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            include_internal: true,
        }
    }

    pub fn from_config(fetcher: OffsetFetcher, config: &DiscoveryConfig) -> Self {
        Self::new(fetcher)
            .with_timeout(config.timeout())
            .with_internal_topics(config.include_internal)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_internal_topics(mut self, include_internal: bool) -> Self {
        self.include_internal = include_internal;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// List the topics and start one aggregation task per topic.
    ///
    /// The listing races a timer. When the timer wins, `CensusError::Timeout`
    /// is returned and the listing keeps running in the background; whatever
    /// it produces afterwards is logged and dropped.
    #[instrument(skip(self), fields(endpoint = %self.fetcher.endpoint()), err)]
    pub async fn list(&self) -> CensusResult<TopicListing> {
        let fetcher = self.fetcher.clone();
        let mut listing = tokio::spawn(async move { fetcher.connect().await?.list_topics().await });
        let timer = tokio::time::sleep(self.timeout);

        tokio::select! {
            biased;
            joined = &mut listing => {
                let topics = joined??;
                debug!(topic.count = topics.len(), "topics listed");
                Ok(self.start_aggregations(topics))
            }
            _ = timer => {
                warn!(timeout = ?self.timeout, "topic listing timed out");
                tokio::spawn(async move {
                    if let Ok(Ok(topics)) = listing.await {
                        warn!(
                            topic.count = topics.len(),
                            "discarding topic listing received after timeout"
                        );
                    }
                });
                Err(CensusError::Timeout(self.timeout))
            }
        }
    }

    /// Run a full discovery and deliver exactly one outcome on the channel:
    /// the resolved snapshot, or a failure when the listing timed out or
    /// failed.
    pub async fn discover(&self, sender: mpsc::Sender<DiscoveryOutcome>) {
        let outcome = match self.list().await {
            Ok(listing) => {
                let snapshot = listing.resolve().await;
                info!(topic.count = snapshot.topics.len(), "discovery complete");
                DiscoveryOutcome::Ready(snapshot)
            }
            Err(CensusError::Timeout(after)) => {
                DiscoveryOutcome::Failed(DiscoveryFailure::TimedOut {
                    timeout_ms: after.as_millis() as u64,
                })
            }
            Err(error) => DiscoveryOutcome::Failed(DiscoveryFailure::Listing {
                message: error.to_string(),
            }),
        };
        if sender.send(outcome).await.is_err() {
            warn!("discovery receiver dropped before delivery");
        }
    }

    fn start_aggregations(&self, mut topics: Vec<TopicMetadata>) -> TopicListing {
        topics.retain(|topic| self.include_internal || !topic.is_internal());
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        let topics = topics
            .into_iter()
            .map(|metadata| {
                let partition_count = metadata.partition_count();
                let fetcher = self.fetcher.clone();
                let topic = metadata.name.clone();
                let messages = tokio::spawn(async move {
                    aggregate_topic(&fetcher, &topic, partition_count).await
                });
                PendingTopic {
                    topic: metadata.name,
                    partition_count,
                    messages,
                }
            })
            .collect();
        TopicListing { topics }
    }
}
