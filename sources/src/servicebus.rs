//! Azure Service Bus source. Receives one message at a time in
//! peek-lock mode, completes it when the fn succeeds, and abandons it
//! otherwise so the broker redelivers. While the fn runs, the lock is
//! renewed on a configurable cadence; a failed renewal cancels the
//! per-message context. Dead-letter mode reads the `$deadletterqueue`
//! sub-queue and skips renewal.
//!
//! The production receiver speaks the Service Bus REST surface with
//! shared-access signatures; the serve loop itself only knows the
//! `BrokerReceiver` trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use common::{decode_map, parse_duration, Configurable, Context, Function, Map, Source, Value};
use errors::{Error, ErrorKind, Result};
use hmac::{Hmac, Mac};
use log::warn;
use serde::Deserialize;
use sha2::Sha256;

const SAS_TOKEN_TTL_SECS: i64 = 300;
const RECEIVE_TIMEOUT_SECS: u32 = 55;

pub struct LockedMessage {
    pub message_id: String,
    pub lock_token: String,
    pub lock_location: String,
    pub content_type: String,
    pub body: String,
}

/// Receive/settle operations the serve loop needs from the broker.
#[async_trait]
pub trait BrokerReceiver: Send + Sync {
    async fn receive(&self) -> Result<Option<LockedMessage>>;
    async fn complete(&self, message: &LockedMessage) -> Result<()>;
    async fn abandon(&self, message: &LockedMessage) -> Result<()>;
    async fn renew_lock(&self, message: &LockedMessage) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceBusConfig {
    connection_string: String,
    queue_name: String,
    #[serde(default)]
    is_dead_letter_receiver: bool,
    #[serde(default)]
    auto_renew_lock_interval: Option<String>,
}

pub struct ServiceBusSource {
    connection_string: String,
    queue_name: String,
    dead_letter: bool,
    renew_interval: Duration,
    receiver: Option<Arc<dyn BrokerReceiver>>,
}

impl ServiceBusSource {
    pub fn new() -> ServiceBusSource {
        ServiceBusSource {
            connection_string: String::new(),
            queue_name: String::new(),
            dead_letter: false,
            renew_interval: Duration::ZERO,
            receiver: None,
        }
    }

    /// Substitutes the broker receiver, bypassing the REST client.
    pub fn with_receiver(receiver: Arc<dyn BrokerReceiver>) -> ServiceBusSource {
        let mut source = ServiceBusSource::new();
        source.receiver = Some(receiver);
        source
    }
}

impl Default for ServiceBusSource {
    fn default() -> Self {
        ServiceBusSource::new()
    }
}

impl Configurable for ServiceBusSource {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: ServiceBusConfig = decode_map(value)?;
        if cfg.connection_string.is_empty() {
            return Err(Error::message(
                ErrorKind::MissingConfig,
                "expected connection string to have a value",
            ));
        }
        if cfg.queue_name.is_empty() {
            return Err(Error::message(
                ErrorKind::MissingConfig,
                "expected queue name to be set",
            ));
        }

        self.connection_string = cfg.connection_string;
        self.queue_name = cfg.queue_name;
        self.dead_letter = cfg.is_dead_letter_receiver;
        if let Some(interval) = cfg.auto_renew_lock_interval {
            self.renew_interval = parse_duration(&interval)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Source for ServiceBusSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        let receiver: Arc<dyn BrokerReceiver> = match &self.receiver {
            Some(receiver) => receiver.clone(),
            None => Arc::new(RestReceiver::connect(
                &self.connection_string,
                &self.queue_name,
                self.dead_letter,
            )?),
        };

        // Lock renewal only applies to the main queue receiver.
        let renew_interval = if self.dead_letter {
            Duration::ZERO
        } else {
            self.renew_interval
        };

        loop {
            let received = tokio::select! {
                _ = ctx.done() => return Ok(()),
                received = receiver.receive() => received?,
            };
            let Some(message) = received else {
                continue;
            };

            let message = Arc::new(message);
            let message_ctx = ctx.child();

            let renewal = if renew_interval > Duration::ZERO {
                let receiver = receiver.clone();
                let message = message.clone();
                let renew_ctx = message_ctx.clone();
                Some(tokio::spawn(async move {
                    loop {
                        tokio::time::sleep(renew_interval).await;
                        if renew_ctx.is_done() {
                            break;
                        }
                        if let Err(e) = receiver.renew_lock(&message).await {
                            warn!("error renewing lock: {e}");
                            renew_ctx.cancel();
                            break;
                        }
                    }
                }))
            } else {
                None
            };

            let mut input = Map::new();
            input.insert(
                "ContentType".to_string(),
                Value::from(message.content_type.as_str()),
            );
            input.insert("Data".to_string(), Value::from(message.body.as_str()));

            let result = f.invoke(&message_ctx, Value::Map(input)).await;
            if let Some(renewal) = renewal {
                renewal.abort();
            }

            match result {
                Ok(_) => {
                    if let Err(e) = receiver.complete(&message).await {
                        if self.dead_letter {
                            warn!("error completing message: {e}");
                        } else {
                            return Err(e);
                        }
                    }
                }
                Err(fn_err) => {
                    warn!("abandoning due to error: {fn_err}");
                    if let Err(e) = receiver.abandon(&message).await {
                        if self.dead_letter {
                            warn!("error abandoning message: {e}");
                        } else {
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}

/// REST client for a single queue (or its dead-letter sub-queue).
struct RestReceiver {
    http: reqwest::Client,
    base: String,
    key_name: String,
    key: String,
}

#[derive(Default, Deserialize)]
struct BrokerProperties {
    #[serde(default, rename = "MessageId")]
    message_id: String,
    #[serde(default, rename = "LockToken")]
    lock_token: String,
}

impl RestReceiver {
    fn connect(connection_string: &str, queue: &str, dead_letter: bool) -> Result<RestReceiver> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        for part in connection_string.split(';') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name {
                "Endpoint" => endpoint = Some(value.to_string()),
                "SharedAccessKeyName" => key_name = Some(value.to_string()),
                // The key itself is base64 and may contain '='.
                "SharedAccessKey" => {
                    key = Some(part["SharedAccessKey=".len()..].to_string());
                }
                _ => {}
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| Error::parse("connection string missing Endpoint"))?
            .replace("sb://", "https://");
        let endpoint = endpoint.trim_end_matches('/');
        let base = if dead_letter {
            format!("{endpoint}/{queue}/$deadletterqueue")
        } else {
            format!("{endpoint}/{queue}")
        };

        Ok(RestReceiver {
            http: reqwest::Client::new(),
            base,
            key_name: key_name
                .ok_or_else(|| Error::parse("connection string missing SharedAccessKeyName"))?,
            key: key.ok_or_else(|| Error::parse("connection string missing SharedAccessKey"))?,
        })
    }

    fn sas_token(&self, resource: &str) -> Result<String> {
        let expiry = Utc::now().timestamp() + SAS_TOKEN_TTL_SECS;
        let encoded_resource = percent_encode(resource);
        let to_sign = format!("{encoded_resource}\n{expiry}");

        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_bytes())
            .map_err(|e| Error::message(ErrorKind::Parse, format!("invalid shared access key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={encoded_resource}&sig={}&se={expiry}&skn={}",
            percent_encode(&signature),
            self.key_name
        ))
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<reqwest::Response> {
        let token = self.sas_token(&self.base)?;
        let response = request
            .header("Authorization", token)
            .send()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("service bus request: {e}")))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(Error::message(
                ErrorKind::Io,
                format!("service bus returned {status} for {url}"),
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl BrokerReceiver for RestReceiver {
    async fn receive(&self) -> Result<Option<LockedMessage>> {
        let url = format!("{}/messages/head?timeout={RECEIVE_TIMEOUT_SECS}", self.base);
        let response = self.send(self.http.post(&url), &url).await?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let properties: BrokerProperties = response
            .headers()
            .get("BrokerProperties")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let lock_location = response
            .headers()
            .get("Location")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{}/messages/{}/{}",
                    self.base, properties.message_id, properties.lock_token
                )
            });
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("reading message body: {e}")))?;

        Ok(Some(LockedMessage {
            message_id: properties.message_id,
            lock_token: properties.lock_token,
            lock_location,
            content_type,
            body,
        }))
    }

    async fn complete(&self, message: &LockedMessage) -> Result<()> {
        let url = &message.lock_location;
        self.send(self.http.delete(url), url).await.map(|_| ())
    }

    async fn abandon(&self, message: &LockedMessage) -> Result<()> {
        let url = &message.lock_location;
        self.send(self.http.put(url), url).await.map(|_| ())
    }

    async fn renew_lock(&self, message: &LockedMessage) -> Result<()> {
        let url = format!(
            "{}/messages/{}/{}/renew-lock",
            self.base, message.message_id, message.lock_token
        );
        self.send(self.http.post(&url), &url).await.map(|_| ())
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{configure, InvokeFunc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBroker {
        queue: Mutex<Vec<(String, String)>>,
        completed: Mutex<Vec<String>>,
        abandoned: Mutex<Vec<String>>,
        renewals: AtomicUsize,
        fail_renewals: bool,
        ctx: Mutex<Option<Context>>,
    }

    #[async_trait]
    impl BrokerReceiver for FakeBroker {
        async fn receive(&self) -> Result<Option<LockedMessage>> {
            let next = self.queue.lock().unwrap().pop();
            match next {
                Some((id, body)) => Ok(Some(LockedMessage {
                    message_id: id.clone(),
                    lock_token: format!("lock-{id}"),
                    lock_location: format!("https://test/{id}"),
                    content_type: "text/plain".to_string(),
                    body,
                })),
                None => {
                    if let Some(ctx) = self.ctx.lock().unwrap().as_ref() {
                        ctx.cancel();
                    }
                    // Emulate an empty long poll.
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(None)
                }
            }
        }

        async fn complete(&self, message: &LockedMessage) -> Result<()> {
            self.completed.lock().unwrap().push(message.message_id.clone());
            Ok(())
        }

        async fn abandon(&self, message: &LockedMessage) -> Result<()> {
            self.abandoned.lock().unwrap().push(message.message_id.clone());
            Ok(())
        }

        async fn renew_lock(&self, _message: &LockedMessage) -> Result<()> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            if self.fail_renewals {
                return Err(Error::message(ErrorKind::Io, "lock lost"));
            }
            Ok(())
        }
    }

    fn configured_with(broker: Arc<FakeBroker>, interval: &str) -> ServiceBusSource {
        let mut source = ServiceBusSource::with_receiver(broker);
        let yaml: serde_yaml::Value = serde_yaml::from_str(&format!(
            "{{connectionString: 'Endpoint=sb://x/;SharedAccessKeyName=k;SharedAccessKey=s', queueName: q, autoRenewLockInterval: {interval}}}"
        ))
        .unwrap();
        configure(&mut source, Some(Value::from_yaml(yaml))).unwrap();
        source
    }

    #[tokio::test]
    async fn completes_on_success_and_abandons_on_failure() {
        let ctx = Context::background();
        let broker = Arc::new(FakeBroker {
            queue: Mutex::new(vec![
                ("bad".to_string(), "poison".to_string()),
                ("good".to_string(), "fine".to_string()),
            ]),
            ctx: Mutex::new(Some(ctx.clone())),
            ..FakeBroker::default()
        });

        let source = configured_with(broker.clone(), "0s");
        let f = Arc::new(InvokeFunc::new(|_ctx: &Context, input: Value| {
            if input.get("Data").as_str() == Some("poison") {
                return Err(Error::invocation("bad payload"));
            }
            assert_eq!(input.get("ContentType").as_str(), Some("text/plain"));
            Ok(Value::Null)
        }));

        source.serve(&ctx, f).await.unwrap();

        assert_eq!(*broker.completed.lock().unwrap(), vec!["good".to_string()]);
        assert_eq!(*broker.abandoned.lock().unwrap(), vec!["bad".to_string()]);
    }

    #[tokio::test]
    async fn renewal_failure_cancels_the_message_context() {
        let ctx = Context::background();
        let broker = Arc::new(FakeBroker {
            queue: Mutex::new(vec![("m".to_string(), "work".to_string())]),
            fail_renewals: true,
            ctx: Mutex::new(Some(ctx.clone())),
            ..FakeBroker::default()
        });

        let source = configured_with(broker.clone(), "20ms");
        // The fn blocks until its context is cancelled by the failed
        // renewal, then reports the cancellation.
        let f = Arc::new(WaitForCancel);
        source.serve(&ctx, f).await.unwrap();

        assert!(broker.renewals.load(Ordering::SeqCst) >= 1);
        assert_eq!(*broker.abandoned.lock().unwrap(), vec!["m".to_string()]);
        assert!(broker.completed.lock().unwrap().is_empty());
    }

    struct WaitForCancel;

    impl Configurable for WaitForCancel {}

    #[async_trait]
    impl common::Function for WaitForCancel {
        async fn invoke(&self, ctx: &Context, _input: Value) -> Result<Value> {
            ctx.done().await;
            Err(ctx.error())
        }
    }

    #[test]
    fn connection_string_parses() {
        let receiver = RestReceiver::connect(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=c2VjcmV0PQ==",
            "jobs",
            false,
        )
        .unwrap();
        assert_eq!(receiver.base, "https://ns.servicebus.windows.net/jobs");
        assert_eq!(receiver.key_name, "root");
        assert_eq!(receiver.key, "c2VjcmV0PQ==");

        let dlq = RestReceiver::connect(
            "Endpoint=sb://ns.servicebus.windows.net/;SharedAccessKeyName=root;SharedAccessKey=k",
            "jobs",
            true,
        )
        .unwrap();
        assert_eq!(
            dlq.base,
            "https://ns.servicebus.windows.net/jobs/$deadletterqueue"
        );
    }

    #[test]
    fn connection_string_requires_all_parts() {
        assert!(RestReceiver::connect("Endpoint=sb://x/", "q", false).is_err());
        assert!(RestReceiver::connect("SharedAccessKeyName=k;SharedAccessKey=s", "q", false).is_err());
    }

    #[test]
    fn sas_token_shape() {
        let receiver = RestReceiver::connect(
            "Endpoint=sb://ns.example/;SharedAccessKeyName=root;SharedAccessKey=key",
            "q",
            false,
        )
        .unwrap();
        let token = receiver.sas_token("https://ns.example/q").unwrap();
        assert!(token.starts_with("SharedAccessSignature sr=https%3A%2F%2Fns.example%2Fq&sig="));
        assert!(token.contains("&se="));
        assert!(token.ends_with("&skn=root"));
    }

    #[test]
    fn percent_encoding_is_rfc3986() {
        assert_eq!(percent_encode("a-b_c.d~e"), "a-b_c.d~e");
        assert_eq!(percent_encode("a b/c="), "a%20b%2Fc%3D");
    }

    #[test]
    fn missing_connection_details_fail_configuration() {
        let mut source = ServiceBusSource::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str("{queueName: q}").unwrap();
        let err = configure(&mut source, Some(Value::from_yaml(yaml))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }
}
