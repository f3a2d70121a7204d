//! SQS polling source. Messages are deleted only after the fn handles
//! them successfully; failed messages are left to reappear when their
//! visibility timeout expires, which keeps the source compatible with
//! any redrive policy on the queue.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use common::{decode_map, Configurable, Context, Function, Map, Source, Value};
use errors::{ConfigError, Error, ErrorKind, Result};
use log::warn;
use serde::Deserialize;

const DEFAULT_VISIBILITY_TIMEOUT: i32 = 30;
const DEFAULT_BATCH_SIZE: i32 = 1;
const RECEIVE_WAIT_SECONDS: i32 = 20;

pub struct QueueMessage {
    pub id: String,
    pub body: String,
    pub receipt: String,
}

/// The slice of the queue service the serve loop needs. The production
/// implementation wraps the AWS SDK; tests substitute their own.
#[async_trait]
pub trait QueueApi: Send + Sync {
    async fn queue_url(&self, queue: &str) -> Result<String>;
    async fn receive(&self, queue_url: &str, max: i32, visibility: i32)
        -> Result<Vec<QueueMessage>>;
    async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()>;
}

struct SdkQueueApi {
    client: Client,
}

#[async_trait]
impl QueueApi for SdkQueueApi {
    async fn queue_url(&self, queue: &str) -> Result<String> {
        let out = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("resolving queue url: {e}")))?;
        out.queue_url()
            .map(str::to_string)
            .ok_or_else(|| Error::message(ErrorKind::Io, format!("queue {queue:?} has no url")))
    }

    async fn receive(
        &self,
        queue_url: &str,
        max: i32,
        visibility: i32,
    ) -> Result<Vec<QueueMessage>> {
        let out = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max)
            .visibility_timeout(visibility)
            .wait_time_seconds(RECEIVE_WAIT_SECONDS)
            .send()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("receiving messages: {e}")))?;

        Ok(out
            .messages()
            .iter()
            .map(|m| QueueMessage {
                id: m.message_id().unwrap_or_default().to_string(),
                body: m.body().unwrap_or_default().to_string(),
                receipt: m.receipt_handle().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn delete(&self, queue_url: &str, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("deleting message: {e}")))?;
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqsConfig {
    queue: String,
    #[serde(default)]
    timeout: Option<i32>,
    #[serde(default)]
    batch_size: Option<i32>,
}

pub struct SqsSource {
    queue: String,
    visibility_timeout: i32,
    batch_size: i32,
    client: Mutex<Option<Arc<dyn QueueApi>>>,
}

impl SqsSource {
    pub fn new() -> SqsSource {
        SqsSource {
            queue: String::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            client: Mutex::new(None),
        }
    }

    /// Substitutes the queue client, bypassing AWS configuration.
    pub fn with_client(client: Arc<dyn QueueApi>) -> SqsSource {
        let source = SqsSource::new();
        *source.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client);
        source
    }

    async fn client(&self) -> Result<Arc<dyn QueueApi>> {
        if let Some(client) = self
            .client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Ok(client);
        }

        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client: Arc<dyn QueueApi> = Arc::new(SdkQueueApi {
            client: Client::new(&config),
        });
        *self.client.lock().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());
        Ok(client)
    }
}

impl Default for SqsSource {
    fn default() -> Self {
        SqsSource::new()
    }
}

impl Configurable for SqsSource {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.queue = value;
        Ok(())
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: SqsConfig = decode_map(value)?;
        self.queue = cfg.queue;
        if let Some(timeout) = cfg.timeout {
            self.visibility_timeout = timeout;
        }
        if let Some(batch_size) = cfg.batch_size {
            self.batch_size = batch_size;
        }
        Ok(())
    }
}

#[async_trait]
impl Source for SqsSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        if self.queue.is_empty() {
            return Err(ConfigError::Missing("sqs source queue".to_string()).into());
        }

        let client = self.client().await?;
        let queue_url = client.queue_url(&self.queue).await?;

        loop {
            let messages = tokio::select! {
                _ = ctx.done() => return Ok(()),
                received = client.receive(&queue_url, self.batch_size, self.visibility_timeout) => {
                    received?
                }
            };

            for message in messages {
                let mut input = Map::new();
                input.insert("id".to_string(), Value::String(message.id));
                input.insert("body".to_string(), Value::String(message.body));

                match f.invoke(ctx, Value::Map(input)).await {
                    Ok(_) => client.delete(&queue_url, &message.receipt).await?,
                    Err(e) => {
                        // Skip the delete; visibility expiry redelivers.
                        warn!("fn failed, leaving message for redelivery: {e}");
                    }
                }
            }
        }
    }
}
