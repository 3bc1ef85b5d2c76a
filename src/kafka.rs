use async_trait::async_trait;
use bytes::Bytes;
use rskafka::{
    client::{
        partition::{Compression, OffsetAt, PartitionClient, UnknownTopicHandling},
        Client, ClientBuilder,
    },
    record::{Record, RecordAndOffset},
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};

use crate::{
    bridge::{InboundMessage, PubSub},
    error::{PedalError, Result},
    types::{KafkaConfig, TopicScheme},
};

/// Every topic is used through its first partition
const PARTITION: i32 = 0;

/// Longest the broker may hold a fetch open waiting for records
const FETCH_WAIT_MS: i32 = 500;

/// Fetch size bounds in bytes
const FETCH_BYTES: std::ops::Range<i32> = 1..1_000_000;

/// Delay before fetching again after a failed fetch
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// [`PubSub`] over a Kafka cluster
///
/// Publishes one record per publication. Subscriptions start at the latest
/// offset, so commands sent while the bridge was down are not replayed.
pub struct KafkaTransport {
    name: String,
    scheme: TopicScheme,
    client: Client,
    partitions: Mutex<HashMap<String, Arc<PartitionClient>>>,
    consumers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl KafkaTransport {
    /// Connect to the cluster and fetch its metadata
    ///
    /// # Errors
    ///
    /// Returns [`PedalError::Timeout`] if the cluster does not answer within
    /// the configured timeout, or [`PedalError::Kafka`] if it refuses.
    pub async fn connect(config: &KafkaConfig) -> Result<Self> {
        let name = format!("kafka://{}", config.bootstrap_servers.join(","));
        info!("Connecting to {}", name);

        let builder = ClientBuilder::new(config.bootstrap_servers.clone());
        let client = tokio::time::timeout(config.connect_timeout(), builder.build())
            .await
            .map_err(|_| PedalError::Timeout {
                timeout_ms: config.connect_timeout_ms,
            })??;
        info!("{} connected", name);

        Ok(Self {
            name,
            scheme: config.scheme,
            client,
            partitions: Mutex::new(HashMap::new()),
            consumers: std::sync::Mutex::new(Vec::new()),
        })
    }

    async fn partition(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        let mut partitions = self.partitions.lock().await;
        if let Some(partition) = partitions.get(topic) {
            return Ok(partition.clone());
        }

        let partition = Arc::new(
            self.client
                .partition_client(topic.to_string(), PARTITION, UnknownTopicHandling::Retry)
                .await?,
        );
        partitions.insert(topic.to_string(), partition.clone());
        Ok(partition)
    }
}

impl Drop for KafkaTransport {
    fn drop(&mut self) {
        if let Ok(consumers) = self.consumers.lock() {
            for consumer in consumers.iter() {
                consumer.abort();
            }
        }
    }
}

fn record(payload: Bytes) -> Record {
    Record {
        key: None,
        value: Some(payload.to_vec()),
        headers: BTreeMap::new(),
        timestamp: chrono::Utc::now(),
    }
}

fn inbound(topic: &str, fetched: RecordAndOffset) -> Option<InboundMessage> {
    fetched.record.value.map(|value| InboundMessage {
        topic: topic.to_string(),
        payload: Bytes::from(value),
    })
}

async fn consume(
    name: String,
    topic: String,
    partition: Arc<PartitionClient>,
    mut offset: i64,
    handler: mpsc::UnboundedSender<InboundMessage>,
) {
    loop {
        let records = match partition
            .fetch_records(offset, FETCH_BYTES, FETCH_WAIT_MS)
            .await
        {
            Ok((records, _high_watermark)) => records,
            Err(e) => {
                warn!("{} fetch from {} failed: {}", name, topic, e);
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };

        for fetched in records {
            offset = offset.max(fetched.offset + 1);
            let Some(message) = inbound(&topic, fetched) else {
                debug!("{} empty record on {}", name, topic);
                continue;
            };
            trace!("{} <- {} ({} bytes)", name, topic, message.payload.len());
            if handler.send(message).is_err() {
                debug!("{} handler for {} is gone", name, topic);
                return;
            }
        }
    }
}

#[async_trait]
impl PubSub for KafkaTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn scheme(&self) -> TopicScheme {
        self.scheme
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let partition = self.partition(topic).await?;
        partition
            .produce(vec![record(payload)], Compression::NoCompression)
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<()> {
        let partition = self.partition(topic).await?;
        let offset = partition.get_offset(OffsetAt::Latest).await?;
        debug!("{} subscribed to {} at offset {}", self.name, topic, offset);

        let consumer = tokio::spawn(consume(
            self.name.clone(),
            topic.to_string(),
            partition,
            offset,
            handler,
        ));
        if let Ok(mut consumers) = self.consumers.lock() {
            consumers.push(consumer);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_carry_the_payload() {
        let record = record(Bytes::from_static(br#"{"value":2.5}"#));
        assert_eq!(record.key, None);
        assert_eq!(record.value.as_deref(), Some(&br#"{"value":2.5}"#[..]));
        assert!(record.headers.is_empty());
    }

    #[test]
    fn test_fetched_records_become_inbound_messages() {
        let topic = "bike.000001.fan.control";
        let fetched = RecordAndOffset {
            record: record(Bytes::from_static(b"60")),
            offset: 41,
        };
        let message = inbound(topic, fetched).unwrap();
        assert_eq!(message.topic, topic);
        assert_eq!(message.payload, Bytes::from_static(b"60"));

        let tombstone = RecordAndOffset {
            record: Record {
                value: None,
                ..record(Bytes::new())
            },
            offset: 42,
        };
        assert!(inbound(topic, tombstone).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_cluster_fails_to_connect() {
        let config = KafkaConfig {
            bootstrap_servers: vec!["127.0.0.1:1".to_string()],
            connect_timeout_ms: 200,
            ..KafkaConfig::default()
        };

        let result = tokio::time::timeout(Duration::from_secs(5), KafkaTransport::connect(&config))
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(PedalError::Timeout { .. } | PedalError::Kafka(_))
        ));
    }
}
