use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Property groups as handed over by the hosting runtime: group name -> key -> value.
pub type ApplicationProperties = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct GeneratorConfig {
    pub rate_per_second: u32,
    pub key_space: Vec<String>,
    /// Inclusive `[min, max]` price range.
    pub value_range: [f64; 2],
    /// Stop after this many events; unbounded when absent.
    pub max_events: Option<u64>,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            rate_per_second: 100,
            key_space: ["AAPL", "AMZN", "MSFT", "INTC", "TBV"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            value_range: [0.0, 100.0],
            max_events: None,
            seed: 0,
        }
    }
}

/// Upper bound on the window length: one year.
pub const MAX_WINDOW_SECONDS: u64 = 366 * 24 * 3_600;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub length_seconds: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { length_seconds: 10 }
    }
}

impl WindowConfig {
    pub fn length(&self) -> Duration {
        Duration::seconds(self.length_seconds as i64)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CheckpointConfig {
    pub interval_ms: u64,
    /// Directory of the file-backed store; in-memory when absent.
    pub dir: Option<PathBuf>,
    pub retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            dir: None,
            retained: 3,
        }
    }
}

impl CheckpointConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Total delivery attempts per batch, including the first.
    pub max_attempts: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval_ms: 1_000,
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkTargetConfig {
    File {
        base_path: PathBuf,
        /// Roll to a new part file after this many rows.
        #[serde(default = "default_max_rows")]
        max_rows: usize,
        /// Roll to a new part file after this many seconds.
        #[serde(default = "default_max_age_secs")]
        max_age_secs: u64,
    },
    Stream {
        stream_name: String,
        #[serde(default)]
        client_config: BTreeMap<String, String>,
    },
}

fn default_max_rows() -> usize {
    100_000
}

fn default_max_age_secs() -> u64 {
    900
}

impl SinkTargetConfig {
    pub fn file(base_path: impl Into<PathBuf>) -> Self {
        SinkTargetConfig::File {
            base_path: base_path.into(),
            max_rows: default_max_rows(),
            max_age_secs: default_max_age_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub parallelism: usize,
    pub generator: GeneratorConfig,
    pub window: WindowConfig,
    pub checkpoint: CheckpointConfig,
    pub dispatch: DispatchConfig,
    pub sink: Option<SinkTargetConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            generator: GeneratorConfig::default(),
            window: WindowConfig::default(),
            checkpoint: CheckpointConfig::default(),
            dispatch: DispatchConfig::default(),
            sink: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(config_err("parallelism must be at least 1"));
        }
        let g = &self.generator;
        if g.rate_per_second == 0 {
            return Err(config_err("generator.rate_per_second must be at least 1"));
        }
        if g.key_space.is_empty() || g.key_space.iter().any(|k| k.is_empty()) {
            return Err(config_err("generator.key_space must list at least one non-empty key"));
        }
        let [min, max] = g.value_range;
        if !min.is_finite() || !max.is_finite() || min > max {
            return Err(config_err(format!(
                "generator.value_range [{min}, {max}] is not a valid range"
            )));
        }
        if self.window.length_seconds == 0 || self.window.length_seconds > MAX_WINDOW_SECONDS {
            return Err(config_err(format!(
                "window.length_seconds must be between 1 and {MAX_WINDOW_SECONDS}, got {}",
                self.window.length_seconds
            )));
        }
        if self.checkpoint.interval_ms == 0 {
            return Err(config_err("checkpoint.interval_ms must be at least 1"));
        }
        if self.dispatch.batch_size == 0 || self.dispatch.max_attempts == 0 {
            return Err(config_err("dispatch.batch_size and dispatch.max_attempts must be at least 1"));
        }
        match &self.sink {
            None => Err(config_err("no sink target configured")),
            Some(SinkTargetConfig::Stream { stream_name, .. }) if stream_name.is_empty() => {
                Err(config_err("stream sink target name not defined"))
            }
            Some(SinkTargetConfig::File { base_path, .. }) if base_path.as_os_str().is_empty() => {
                Err(config_err("file sink target base path not defined"))
            }
            Some(_) => Ok(()),
        }
    }

    /// Resolves the flat property groups of the hosting runtime.
    ///
    /// Missing groups fall back to defaults; the sink group is required.
    pub fn from_properties(props: &ApplicationProperties) -> Result<Self> {
        let mut cfg = PipelineConfig::default();

        if let Some(v) = prop::<usize>(props, "Pipeline", "parallelism")? {
            cfg.parallelism = v;
        }

        if let Some(v) = prop::<u32>(props, "Generator", "rate.per.second")? {
            cfg.generator.rate_per_second = v;
        }
        if let Some(v) = raw(props, "Generator", "key.space") {
            cfg.generator.key_space = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = prop::<f64>(props, "Generator", "value.min")? {
            cfg.generator.value_range[0] = v;
        }
        if let Some(v) = prop::<f64>(props, "Generator", "value.max")? {
            cfg.generator.value_range[1] = v;
        }
        cfg.generator.max_events = prop::<u64>(props, "Generator", "max.events")?;
        if let Some(v) = prop::<u64>(props, "Generator", "seed")? {
            cfg.generator.seed = v;
        }

        if let Some(v) = prop::<u64>(props, "Window", "length.seconds")? {
            cfg.window.length_seconds = v;
        } else if let Some(v) = raw(props, "Window", "length") {
            cfg.window.length_seconds = parse_duration_ms(v)? / 1_000;
        }

        if let Some(v) = prop::<u64>(props, "Checkpoint", "interval.ms")? {
            cfg.checkpoint.interval_ms = v;
        }
        if let Some(v) = raw(props, "Checkpoint", "dir") {
            cfg.checkpoint.dir = Some(PathBuf::from(v));
        }
        if let Some(v) = prop::<usize>(props, "Checkpoint", "retained")? {
            cfg.checkpoint.retained = v;
        }

        if let Some(v) = prop::<usize>(props, "Dispatch", "batch.size")? {
            cfg.dispatch.batch_size = v;
        }
        if let Some(v) = raw(props, "Dispatch", "flush.interval") {
            cfg.dispatch.flush_interval_ms = parse_duration_ms(v)?;
        }
        if let Some(v) = prop::<usize>(props, "Dispatch", "max.attempts")? {
            cfg.dispatch.max_attempts = v;
        }
        if let Some(v) = prop::<u64>(props, "Dispatch", "initial.backoff.ms")? {
            cfg.dispatch.initial_backoff_ms = v;
        }
        if let Some(v) = prop::<u64>(props, "Dispatch", "max.backoff.ms")? {
            cfg.dispatch.max_backoff_ms = v;
        }

        cfg.sink = Some(sink_from_properties(props)?);
        cfg.validate()?;
        Ok(cfg)
    }
}

fn sink_from_properties(props: &ApplicationProperties) -> Result<SinkTargetConfig> {
    if let Some(group) = props.get("OutputStream0") {
        let stream_name = group
            .get("stream.name")
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or_else(|| config_err("OutputStream0: stream.name not defined"))?;
        let client_config = group
            .iter()
            .filter(|(k, _)| k.as_str() != "stream.name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        return Ok(SinkTargetConfig::Stream {
            stream_name,
            client_config,
        });
    }
    if let Some(base) = raw(props, "OutputPath0", "base.path") {
        return Ok(SinkTargetConfig::file(base));
    }
    if props.contains_key("bucket") {
        let name = raw(props, "bucket", "name")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| config_err("target bucket name not defined"))?;
        return Ok(SinkTargetConfig::file(PathBuf::from(name).join("output")));
    }
    Err(config_err(
        "no sink target defined (expected OutputStream0, OutputPath0 or bucket)",
    ))
}

fn raw<'a>(props: &'a ApplicationProperties, group: &str, key: &str) -> Option<&'a str> {
    props.get(group).and_then(|g| g.get(key)).map(|s| s.trim())
}

fn prop<T: FromStr>(props: &ApplicationProperties, group: &str, key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match raw(props, group, key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| config_err(format!("invalid value for {group}.{key} = {v:?}: {e}"))),
    }
}

fn config_err(msg: impl Into<String>) -> Error {
    Error::Configuration(msg.into())
}

/// Parses non-negative durations like "10s", "500ms", "2m" into milliseconds.
pub fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        // default assume seconds
        (s, 1_000)
    };
    num.trim()
        .parse::<u64>()
        .map_err(|e| config_err(format!("invalid duration {s:?}: {e}")))?
        .checked_mul(unit_ms)
        .ok_or_else(|| config_err(format!("duration {s:?} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn toml_config_with_defaults() {
        let cfg = PipelineConfig::from_toml_str(
            r#"
            [generator]
            rate_per_second = 50
            key_space = ["AAPL", "GOOG"]

            [sink]
            kind = "file"
            base_path = "/tmp/ticker-out"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.parallelism, 2);
        assert_eq!(cfg.window.length_seconds, 10);
        assert_eq!(cfg.checkpoint.interval_ms, 60_000);
        assert_eq!(cfg.generator.rate_per_second, 50);
        assert_eq!(cfg.generator.value_range, [0.0, 100.0]);
        match cfg.sink.unwrap() {
            SinkTargetConfig::File { base_path, max_rows, .. } => {
                assert_eq!(base_path, PathBuf::from("/tmp/ticker-out"));
                assert_eq!(max_rows, 100_000);
            }
            other => panic!("unexpected sink {other:?}"),
        }
    }

    #[test]
    fn missing_sink_is_configuration_error() {
        let err = PipelineConfig::from_toml_str("parallelism = 4").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn invalid_value_range_rejected() {
        let mut cfg = PipelineConfig {
            sink: Some(SinkTargetConfig::file("/tmp/x")),
            ..Default::default()
        };
        cfg.generator.value_range = [5.0, 1.0];
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn properties_stream_target() {
        let mut props = ApplicationProperties::new();
        props.insert(
            "OutputStream0".into(),
            group(&[("stream.name", "prices"), ("aws.region", "eu-west-1")]),
        );
        props.insert("Generator".into(), group(&[("key.space", "AAPL, GOOG"), ("rate.per.second", "10")]));
        props.insert("Window".into(), group(&[("length", "30s")]));
        let cfg = PipelineConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.generator.key_space, vec!["AAPL".to_string(), "GOOG".to_string()]);
        assert_eq!(cfg.window.length_seconds, 30);
        match cfg.sink.unwrap() {
            SinkTargetConfig::Stream { stream_name, client_config } => {
                assert_eq!(stream_name, "prices");
                assert_eq!(client_config.get("aws.region").map(String::as_str), Some("eu-west-1"));
                assert!(!client_config.contains_key("stream.name"));
            }
            other => panic!("unexpected sink {other:?}"),
        }
    }

    #[test]
    fn properties_without_stream_name_fail() {
        let mut props = ApplicationProperties::new();
        props.insert("OutputStream0".into(), group(&[("aws.region", "eu-west-1")]));
        let err = PipelineConfig::from_properties(&props).unwrap_err();
        assert!(err.to_string().contains("stream.name"));
    }

    #[test]
    fn properties_bucket_resolves_file_target() {
        let mut props = ApplicationProperties::new();
        props.insert("bucket".into(), group(&[("name", "my-bucket")]));
        props.insert("Checkpoint".into(), group(&[("interval.ms", "5000")]));
        let cfg = PipelineConfig::from_properties(&props).unwrap();
        assert_eq!(cfg.checkpoint.interval_ms, 5_000);
        assert_eq!(cfg.sink, Some(SinkTargetConfig::file("my-bucket/output")));
    }

    #[test]
    fn properties_bad_number_is_configuration_error() {
        let mut props = ApplicationProperties::new();
        props.insert("OutputPath0".into(), group(&[("base.path", "/tmp/out")]));
        props.insert("Pipeline".into(), group(&[("parallelism", "many")]));
        assert!(matches!(
            PipelineConfig::from_properties(&props),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_duration_ms("3").unwrap(), 3_000);
        assert!(parse_duration_ms("abc").is_err());
        assert!(parse_duration_ms("-10s").is_err());
        assert!(parse_duration_ms("99999999999999999h").is_err());
    }

    #[test]
    fn negative_durations_in_properties_rejected() {
        let mut props = ApplicationProperties::new();
        props.insert("OutputPath0".into(), group(&[("base.path", "/tmp/out")]));
        props.insert("Window".into(), group(&[("length", "-10s")]));
        assert!(matches!(
            PipelineConfig::from_properties(&props),
            Err(Error::Configuration(_))
        ));

        props.insert("Window".into(), group(&[("length", "10s")]));
        props.insert("Dispatch".into(), group(&[("flush.interval", "-500ms")]));
        assert!(matches!(
            PipelineConfig::from_properties(&props),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn window_length_is_bounded() {
        let mut cfg = PipelineConfig {
            sink: Some(SinkTargetConfig::file("/tmp/x")),
            ..Default::default()
        };
        cfg.window.length_seconds = MAX_WINDOW_SECONDS;
        assert!(cfg.validate().is_ok());
        cfg.window.length_seconds = u64::MAX;
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));

        let err = PipelineConfig::from_toml_str(
            r#"
            [window]
            length_seconds = 9223372036854775807

            [sink]
            kind = "file"
            base_path = "/tmp/ticker-out"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("window.length_seconds"), "{err}");
    }
}
