use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Middleware, Value};
use errors::{ConfigError, Error, ErrorKind, Result};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KafkaConfig {
    #[serde(default)]
    success_topic: String,
    #[serde(default)]
    error_topic: String,
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,
    #[serde(default)]
    ca_file: String,
}

/// Publishes the fn's output to `successTopic` and/or its error text to
/// `errorTopic`. The producer is created lazily on the first
/// invocation. Publish failures on the error path are chained onto the
/// returned error instead of masking it.
#[derive(Default)]
pub struct KafkaMiddleware {
    brokers: Vec<String>,
    config: Option<KafkaConfig>,
    producer: OnceLock<std::result::Result<FutureProducer, String>>,
}

impl KafkaMiddleware {
    pub fn new() -> KafkaMiddleware {
        KafkaMiddleware::default()
    }

    fn producer(&self) -> Result<FutureProducer> {
        let made = self.producer.get_or_init(|| {
            let mut client = ClientConfig::new();
            client.set("bootstrap.servers", self.brokers.join(","));
            client.set("message.timeout.ms", "5000");

            if let Some(cfg) = &self.config {
                if !cfg.cert_file.is_empty() && !cfg.key_file.is_empty() && !cfg.ca_file.is_empty()
                {
                    client
                        .set("security.protocol", "ssl")
                        .set("ssl.certificate.location", &cfg.cert_file)
                        .set("ssl.key.location", &cfg.key_file)
                        .set("ssl.ca.location", &cfg.ca_file);
                }
            }

            client.create().map_err(|e| e.to_string())
        });

        match made {
            Ok(producer) => Ok(producer.clone()),
            Err(e) => Err(Error::message(
                ErrorKind::Io,
                format!("creating kafka producer: {e}"),
            )),
        }
    }

    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let producer = self.producer()?;
        let record = FutureRecord::to(topic).payload(&payload).key("");
        producer
            .send(record, Duration::from_secs(5))
            .await
            .map(|_| ())
            .map_err(|(e, _)| {
                Error::message(ErrorKind::Io, format!("publishing to {topic}: {e}"))
            })
    }
}

impl Configurable for KafkaMiddleware {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, mut value: Map) -> Result<()> {
        self.brokers = match value.remove("brokers") {
            Some(Value::String(s)) => s.split(',').map(|b| b.trim().to_string()).collect(),
            Some(Value::Sequence(seq)) => {
                let mut brokers = Vec::with_capacity(seq.len());
                for broker in seq {
                    match broker {
                        Value::String(s) => brokers.push(s),
                        other => {
                            return Err(ConfigError::Shape {
                                target: "kafka brokers entry".to_string(),
                                shape: other.shape(),
                            }
                            .into())
                        }
                    }
                }
                brokers
            }
            Some(other) => {
                return Err(ConfigError::Shape {
                    target: "kafka brokers".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
            None => return Err(ConfigError::RequiredKey("brokers").into()),
        };

        self.config = Some(decode_map(value)?);
        Ok(())
    }
}

#[async_trait]
impl Middleware for KafkaMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("kafka middleware".to_string()))?;

        let result = next.invoke(ctx, input).await;

        match result {
            Err(err) => {
                if !config.error_topic.is_empty() {
                    if let Err(publish_err) =
                        self.publish(&config.error_topic, err.to_string()).await
                    {
                        return Err(err.wrap(publish_err.to_string()));
                    }
                }
                Err(err)
            }
            Ok(output) => {
                if !config.success_topic.is_empty() {
                    self.publish(&config.success_topic, output.to_string())
                        .await?;
                }
                Ok(output)
            }
        }
    }
}
