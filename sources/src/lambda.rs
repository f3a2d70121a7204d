//! AWS Lambda custom-runtime source. Loops over the runtime API's
//! `next` endpoint, invokes the fn, and posts the output to the
//! `response` endpoint or the failure to the `error` endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Source, Value};
use errors::{Error, ErrorKind, Result};
use serde::Deserialize;
use serde_json::json;

const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
const RUNTIME_API_VERSION: &str = "2018-06-01";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LambdaConfig {
    #[serde(rename = "runtimeAPI")]
    runtime_api: Option<String>,
    json_deserialize_event: Option<bool>,
}

pub struct LambdaSource {
    runtime_api: String,
    json_deserialize_event: bool,
    http: reqwest::Client,
}

impl LambdaSource {
    pub fn new() -> LambdaSource {
        LambdaSource {
            runtime_api: std::env::var(RUNTIME_API_ENV).unwrap_or_default(),
            json_deserialize_event: true,
            http: reqwest::Client::new(),
        }
    }
}

impl Default for LambdaSource {
    fn default() -> Self {
        LambdaSource::new()
    }
}

impl Configurable for LambdaSource {
    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: LambdaConfig = decode_map(value)?;
        if let Some(api) = cfg.runtime_api {
            self.runtime_api = api;
        }
        if let Some(deserialize) = cfg.json_deserialize_event {
            self.json_deserialize_event = deserialize;
        }
        Ok(())
    }
}

/// Invocation headers captured before the body read consumes the
/// response.
struct InvocationMeta {
    request_id: String,
    deadline_ms: Option<i64>,
    function_arn: Option<String>,
    trace_id: Option<String>,
}

impl InvocationMeta {
    fn from_response(response: &reqwest::Response) -> InvocationMeta {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        InvocationMeta {
            request_id: header("Lambda-Runtime-Aws-Request-Id").unwrap_or_default(),
            deadline_ms: header("Lambda-Runtime-Deadline-Ms").and_then(|v| v.parse().ok()),
            function_arn: header("Lambda-Runtime-Invoked-Function-Arn"),
            trace_id: header("Lambda-Runtime-Trace-Id"),
        }
    }
}

impl LambdaSource {
    fn build_input(&self, meta: &InvocationMeta, event: String) -> Result<Map> {
        let mut input = Map::new();

        if !meta.request_id.is_empty() {
            input.insert(
                "LambdaRuntimeAwsRequestId".to_string(),
                Value::from(meta.request_id.as_str()),
            );
        }
        if let Some(ms) = meta.deadline_ms {
            input.insert("LambdaRuntimeDeadlineMs".to_string(), Value::Integer(ms));
        }
        if let Some(arn) = &meta.function_arn {
            input.insert(
                "LambdaRuntimeInvokedFunctionArn".to_string(),
                Value::from(arn.as_str()),
            );
        }
        if let Some(trace_id) = &meta.trace_id {
            input.insert(
                "LambdaRuntimeTraceId".to_string(),
                Value::from(trace_id.as_str()),
            );
        }

        let event = if self.json_deserialize_event {
            let json: serde_json::Value = serde_json::from_str(&event)?;
            match Value::from_json(json) {
                map @ Value::Map(_) => map,
                other => {
                    return Err(Error::parse(format!(
                        "expected event to be a JSON object but it was {}",
                        other.shape()
                    )))
                }
            }
        } else {
            Value::String(event)
        };
        input.insert("event".to_string(), event);

        Ok(input)
    }

    async fn post_error(&self, base: &str, invocation_id: &str, err: &Error) -> Result<()> {
        let url = format!("{base}/{invocation_id}/error");
        let payload = json!({
            "errorMessage": err.to_string(),
            "errorType": "FunctionExecutionError",
        });
        self.http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| Error::message(ErrorKind::Io, format!("posting error: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl Source for LambdaSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        let base = format!(
            "http://{}/{RUNTIME_API_VERSION}/runtime/invocation",
            self.runtime_api
        );
        let next_url = format!("{base}/next");

        loop {
            let response = tokio::select! {
                _ = ctx.done() => return Ok(()),
                response = self.http.get(&next_url).send() => {
                    response.map_err(|e| {
                        Error::message(ErrorKind::Io, format!("polling {next_url}: {e}"))
                    })?
                }
            };

            let meta = InvocationMeta::from_response(&response);
            let event = response
                .text()
                .await
                .map_err(|e| Error::message(ErrorKind::Io, format!("reading event: {e}")))?;

            let input = self.build_input(&meta, event)?;

            match f.invoke(ctx, Value::Map(input)).await {
                Err(err) => {
                    self.post_error(&base, &meta.request_id, &err).await?;
                }
                Ok(output) => {
                    let body = match &output {
                        Value::Map(_) => serde_json::to_string(&output.to_json())?,
                        other => other.to_string(),
                    };
                    let url = format!("{base}/{}/response", meta.request_id);
                    // Delivery of the response is best effort, as is the
                    // runtime contract.
                    let _ = self
                        .http
                        .post(&url)
                        .header(reqwest::header::CONTENT_TYPE, "application/json")
                        .body(body)
                        .send()
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::Router;
    use common::{configure, InvokeFunc};
    use std::sync::Mutex;

    struct RuntimeStub {
        ctx: Context,
        responses: Mutex<Vec<(String, String)>>,
        errors: Mutex<Vec<(String, String)>>,
    }

    async fn start_stub(ctx: Context) -> (std::net::SocketAddr, Arc<RuntimeStub>) {
        let stub = Arc::new(RuntimeStub {
            ctx,
            responses: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route(
                "/2018-06-01/runtime/invocation/next",
                get(|| async {
                    let mut headers = HeaderMap::new();
                    headers.insert("Lambda-Runtime-Aws-Request-Id", "req-1".parse().unwrap());
                    headers.insert("Lambda-Runtime-Deadline-Ms", "123456".parse().unwrap());
                    headers.insert(
                        "Lambda-Runtime-Invoked-Function-Arn",
                        "arn:aws:lambda:test".parse().unwrap(),
                    );
                    (headers, r#"{"a":1}"#)
                }),
            )
            .route(
                "/2018-06-01/runtime/invocation/{id}/response",
                post(
                    |State(stub): State<Arc<RuntimeStub>>,
                     axum::extract::Path(id): axum::extract::Path<String>,
                     body: String| async move {
                        stub.responses.lock().unwrap().push((id, body));
                        stub.ctx.cancel();
                        "ok"
                    },
                ),
            )
            .route(
                "/2018-06-01/runtime/invocation/{id}/error",
                post(
                    |State(stub): State<Arc<RuntimeStub>>,
                     axum::extract::Path(id): axum::extract::Path<String>,
                     body: String| async move {
                        stub.errors.lock().unwrap().push((id, body));
                        stub.ctx.cancel();
                        "ok"
                    },
                ),
            )
            .with_state(stub.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, stub)
    }

    fn configured(addr: std::net::SocketAddr) -> LambdaSource {
        let mut source = LambdaSource::new();
        let mut map = Map::new();
        map.insert("runtimeAPI".to_string(), Value::String(addr.to_string()));
        configure(&mut source, Some(Value::Map(map))).unwrap();
        source
    }

    #[tokio::test]
    async fn posts_json_output_to_the_response_endpoint() {
        let ctx = Context::background();
        let (addr, stub) = start_stub(ctx.clone()).await;
        let source = configured(addr);

        let f = Arc::new(InvokeFunc::new(|_ctx: &Context, input: Value| {
            assert_eq!(input.get("LambdaRuntimeAwsRequestId").as_str(), Some("req-1"));
            assert_eq!(input.get("LambdaRuntimeDeadlineMs").as_i64(), Some(123456));
            assert_eq!(input.get("event").get("a").as_i64(), Some(1));

            let mut out = Map::new();
            out.insert("ok".to_string(), Value::Bool(true));
            Ok(Value::Map(out))
        }));

        source.serve(&ctx, f).await.unwrap();

        let responses = stub.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "req-1");
        assert_eq!(responses[0].1, r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn posts_failures_to_the_error_endpoint() {
        let ctx = Context::background();
        let (addr, stub) = start_stub(ctx.clone()).await;
        let source = configured(addr);

        let f = Arc::new(InvokeFunc::new(|_ctx: &Context, _input: Value| {
            Err(Error::invocation("lambda handler failed"))
        }));

        source.serve(&ctx, f).await.unwrap();

        let errors = stub.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "req-1");
        assert!(errors[0].1.contains("lambda handler failed"));
        assert!(errors[0].1.contains("FunctionExecutionError"));
        assert!(stub.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn raw_event_mode_keeps_the_body_as_a_string() {
        let ctx = Context::background();
        let (addr, _stub) = start_stub(ctx.clone()).await;

        let mut source = LambdaSource::new();
        let mut map = Map::new();
        map.insert("runtimeAPI".to_string(), Value::String(addr.to_string()));
        map.insert("jsonDeserializeEvent".to_string(), Value::Bool(false));
        configure(&mut source, Some(Value::Map(map))).unwrap();

        let f = Arc::new(InvokeFunc::new(|_ctx: &Context, input: Value| {
            assert_eq!(input.get("event").as_str(), Some(r#"{"a":1}"#));
            Ok(Value::from("done"))
        }));

        source.serve(&ctx, f).await.unwrap();
    }
}
