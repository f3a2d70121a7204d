//! Consumer-group source. Messages are handed to the fn one at a time;
//! the offset is stored only after a successful invocation (or when
//! `ignoreErrors` is set), so uncommitted messages are redelivered
//! after a rebalance. In strict mode a fn error aborts the serve loop
//! with that error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{Configurable, Context, Function, Map, Source, Value};
use errors::{ConfigError, Error, ErrorKind, Result};
use log::{debug, error, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;

#[derive(Debug)]
struct KafkaSourceConfig {
    brokers: Vec<String>,
    group: String,
    topics: Vec<String>,
    assignor: &'static str,
    version: String,
    oldest: bool,
    ignore_errors: bool,
}

#[derive(Debug)]
pub struct KafkaSource {
    config: Option<KafkaSourceConfig>,
}

impl KafkaSource {
    pub fn new() -> KafkaSource {
        KafkaSource { config: None }
    }
}

impl Default for KafkaSource {
    fn default() -> Self {
        KafkaSource::new()
    }
}

fn string_list(value: Value, what: &str) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(s.split(',').map(|part| part.trim().to_string()).collect()),
        Value::Sequence(seq) => {
            let mut out = Vec::with_capacity(seq.len());
            for element in seq {
                match element {
                    Value::String(s) => out.push(s),
                    other => {
                        return Err(ConfigError::Shape {
                            target: format!("kafka {what} entry"),
                            shape: other.shape(),
                        }
                        .into())
                    }
                }
            }
            Ok(out)
        }
        other => Err(ConfigError::Shape {
            target: format!("kafka {what}"),
            shape: other.shape(),
        }
        .into()),
    }
}

fn parse_assignor(name: &str) -> Result<&'static str> {
    match name {
        "sticky" => Ok("cooperative-sticky"),
        "roundrobin" => Ok("roundrobin"),
        "range" => Ok("range"),
        other => Err(Error::parse(format!("unrecognized balance strategy {other:?}"))),
    }
}

fn parse_version(version: &str) -> Result<String> {
    let valid = !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(Error::parse(format!("invalid kafka version {version:?}")));
    }
    Ok(version.to_string())
}

impl Configurable for KafkaSource {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, mut value: Map) -> Result<()> {
        let brokers = string_list(
            value
                .remove("brokers")
                .ok_or(ConfigError::RequiredKey("brokers"))?,
            "brokers",
        )?;
        let topics = string_list(
            value
                .remove("topics")
                .ok_or(ConfigError::RequiredKey("topics"))?,
            "topics",
        )?;
        let group = match value.remove("group") {
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(ConfigError::Shape {
                    target: "kafka group".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
            None => return Err(ConfigError::RequiredKey("group").into()),
        };

        let assignor = match value.remove("assignor") {
            Some(Value::String(s)) => parse_assignor(&s)?,
            Some(other) => {
                return Err(ConfigError::Shape {
                    target: "kafka assignor".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
            None => parse_assignor("sticky")?,
        };

        let version = match value.remove("version") {
            Some(Value::String(s)) => parse_version(&s)?,
            Some(other) => {
                return Err(ConfigError::Shape {
                    target: "kafka version".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
            None => String::new(),
        };

        let oldest = matches!(value.remove("oldest"), Some(Value::Bool(true)));
        let ignore_errors = matches!(value.remove("ignoreErrors"), Some(Value::Bool(true)));

        self.config = Some(KafkaSourceConfig {
            brokers,
            group,
            topics,
            assignor,
            version,
            oldest,
            ignore_errors,
        });
        Ok(())
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("kafka source".to_string()))?;

        let mut client = ClientConfig::new();
        client
            .set("group.id", &config.group)
            .set("bootstrap.servers", config.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("partition.assignment.strategy", config.assignor)
            .set(
                "auto.offset.reset",
                if config.oldest { "earliest" } else { "latest" },
            );
        if !config.version.is_empty() {
            client.set("broker.version.fallback", &config.version);
        }

        let consumer: StreamConsumer = client
            .create()
            .map_err(|e| Error::with_message(ErrorKind::Io, "creating consumer group client", Some(e)))?;
        let topics: Vec<&str> = config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| Error::with_message(ErrorKind::Io, "subscribing", Some(e)))?;

        loop {
            let message = tokio::select! {
                _ = ctx.done() => break,
                message = consumer.recv() => message,
            };

            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    error!("kafka receive error: {e}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let input = message_input(&message);
            match f.invoke(ctx, Value::Map(input)).await {
                Ok(_) => {}
                Err(e) if config.ignore_errors => {
                    debug!("ignoring fn error for offset {}: {e}", message.offset());
                }
                Err(e) => {
                    // Strict mode: leave the offset unstored so the
                    // group redelivers after rebalancing.
                    return Err(e);
                }
            }

            if let Err(e) = consumer.store_offset_from_message(&message) {
                warn!("failed to store offset {}: {e}", message.offset());
            }
        }

        // Leaving the group commits stored offsets and triggers an
        // immediate rebalance for the remaining members.
        consumer.unsubscribe();
        Ok(())
    }
}

fn message_input(message: &rdkafka::message::BorrowedMessage<'_>) -> Map {
    let mut input = Map::new();
    input.insert(
        "key".to_string(),
        Value::String(
            message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default(),
        ),
    );
    input.insert(
        "value".to_string(),
        Value::String(
            message
                .payload()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
        ),
    );
    input.insert("offset".to_string(), Value::Integer(message.offset()));
    input.insert(
        "partition".to_string(),
        Value::Integer(message.partition() as i64),
    );
    input.insert("topic".to_string(), Value::from(message.topic()));

    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    input.insert("timestamp".to_string(), Value::Timestamp(timestamp));

    input
}
