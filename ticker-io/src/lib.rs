//! ticker-io: result delivery.
//! - `SinkDispatcher`: batching, retrying bridge from a lane to a sink target
//! - `FileTarget`: hourly-bucketed JSON lines on a file system path
//! - `StreamTarget`: partitioned stream append (Kafka behind the `kafka` feature)

use std::time::Duration;

use ticker_core::{Result, SinkTarget, SinkTargetConfig};

pub mod dispatcher;
pub mod file_sink;
pub mod stream;

pub use dispatcher::{RetryPolicy, SinkDispatcher};
pub use file_sink::FileTarget;
#[cfg(feature = "kafka")]
pub use stream::KafkaProducer;
pub use stream::{partition_key, StreamProducer, StreamTarget};

/// Builds the configured target for one lane.
pub fn build_target(cfg: &SinkTargetConfig, lane: usize) -> Result<Box<dyn SinkTarget>> {
    match cfg {
        SinkTargetConfig::File {
            base_path,
            max_rows,
            max_age_secs,
        } => Ok(Box::new(FileTarget::new(
            base_path.clone(),
            lane,
            *max_rows,
            Duration::from_secs(*max_age_secs),
        ))),
        SinkTargetConfig::Stream {
            stream_name,
            client_config,
        } => stream_target(stream_name, client_config),
    }
}

#[cfg(feature = "kafka")]
fn stream_target(
    stream_name: &str,
    client_config: &std::collections::BTreeMap<String, String>,
) -> Result<Box<dyn SinkTarget>> {
    let producer = KafkaProducer::new(client_config)?;
    Ok(Box::new(StreamTarget::new(stream_name, producer)))
}

#[cfg(not(feature = "kafka"))]
fn stream_target(
    stream_name: &str,
    _client_config: &std::collections::BTreeMap<String, String>,
) -> Result<Box<dyn SinkTarget>> {
    Err(ticker_core::Error::Configuration(format!(
        "stream target `{stream_name}` requires the `kafka` feature"
    )))
}
