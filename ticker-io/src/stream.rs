use async_trait::async_trait;
use ticker_core::metrics::BYTES_WRITTEN;
use ticker_core::{Result, SinkTarget};

/// Client side of an append-only partitioned stream.
#[async_trait]
pub trait StreamProducer: Send {
    async fn send(&mut self, stream: &str, partition_key: &str, payload: &[u8]) -> Result<()>;
}

/// Partition key of a record: the decimal hash of its serialized payload.
pub fn partition_key(payload: &[u8]) -> String {
    seahash::hash(payload).to_string()
}

/// Appends every record to a named stream, one message per record.
pub struct StreamTarget<P> {
    stream_name: String,
    producer: P,
}

impl<P: StreamProducer> StreamTarget<P> {
    pub fn new(stream_name: impl Into<String>, producer: P) -> Self {
        Self {
            stream_name: stream_name.into(),
            producer,
        }
    }

    pub fn producer(&self) -> &P {
        &self.producer
    }
}

#[async_trait]
impl<P: StreamProducer> SinkTarget for StreamTarget<P> {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn write(&mut self, batch: &[Vec<u8>]) -> Result<()> {
        for payload in batch {
            let key = partition_key(payload);
            self.producer.send(&self.stream_name, &key, payload).await?;
            BYTES_WRITTEN.with_label_values(&["stream"]).inc_by(payload.len() as u64);
        }
        Ok(())
    }
}

#[cfg(feature = "kafka")]
mod kafka {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use anyhow::Context as _;
    use async_trait::async_trait;
    use rdkafka::producer::{FutureProducer, FutureRecord};
    use rdkafka::ClientConfig;
    use ticker_core::{Error, Result};

    use super::StreamProducer;

    /// Kafka-backed producer; the stream name is the topic.
    pub struct KafkaProducer {
        producer: FutureProducer,
        queue_timeout: Duration,
    }

    impl KafkaProducer {
        /// Every client config entry is passed to librdkafka verbatim.
        pub fn new(client_config: &BTreeMap<String, String>) -> Result<Self> {
            let mut cfg = ClientConfig::new();
            cfg.set("acks", "all");
            for (k, v) in client_config {
                cfg.set(k, v);
            }
            let producer: FutureProducer = cfg.create().context("failed to create kafka producer")?;
            Ok(Self {
                producer,
                queue_timeout: Duration::from_secs(5),
            })
        }
    }

    #[async_trait]
    impl StreamProducer for KafkaProducer {
        async fn send(&mut self, stream: &str, partition_key: &str, payload: &[u8]) -> Result<()> {
            let record = FutureRecord::to(stream).key(partition_key).payload(payload);
            self.producer
                .send(record, self.queue_timeout)
                .await
                .map(|_| ())
                .map_err(|(e, _)| Error::TransientSink(format!("kafka delivery to {stream} failed: {e}")))
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::KafkaProducer;

#[cfg(test)]
mod tests {
    use super::*;
    use ticker_core::Error;

    #[derive(Default)]
    struct Recording {
        sent: Vec<(String, String, Vec<u8>)>,
        fail: bool,
    }

    #[async_trait]
    impl StreamProducer for Recording {
        async fn send(&mut self, stream: &str, partition_key: &str, payload: &[u8]) -> Result<()> {
            if self.fail {
                return Err(Error::TransientSink("throttled".into()));
            }
            self.sent.push((stream.into(), partition_key.into(), payload.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn partition_key_is_decimal_and_stable() {
        let a = partition_key(b"{\"ticker\":\"AAPL\"}");
        assert!(a.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(a, partition_key(b"{\"ticker\":\"AAPL\"}"));
        assert_ne!(a, partition_key(b"{\"ticker\":\"GOOG\"}"));
    }

    #[tokio::test]
    async fn sends_each_record_with_payload_key() {
        let mut t = StreamTarget::new("ExampleOutputStream", Recording::default());
        let batch = vec![b"one".to_vec(), b"two".to_vec()];
        t.write(&batch).await.unwrap();
        let sent = &t.producer().sent;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "ExampleOutputStream");
        assert_eq!(sent[0].1, partition_key(b"one"));
        assert_eq!(sent[1].2, b"two".to_vec());
    }

    #[tokio::test]
    async fn producer_errors_propagate() {
        let mut t = StreamTarget::new(
            "s",
            Recording {
                fail: true,
                ..Default::default()
            },
        );
        let err = t.write(&[b"x".to_vec()]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
