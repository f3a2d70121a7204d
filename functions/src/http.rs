use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Value};
use errors::{ConfigError, Error, ErrorKind, Result};
use serde::Deserialize;

fn default_content_type() -> String {
    "application/json".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpFnConfig {
    #[serde(rename = "targetURL")]
    target_url: String,
    #[serde(default = "default_content_type")]
    content_type: String,
}

/// Function that POSTs its input to a remote endpoint and returns the
/// response body. 2xx/3xx statuses are successes; anything from 400 up
/// turns the body into an invocation error.
#[derive(Default)]
pub struct HttpFn {
    config: Option<HttpFnConfig>,
    client: reqwest::Client,
}

impl HttpFn {
    pub fn new() -> HttpFn {
        HttpFn::default()
    }
}

impl Configurable for HttpFn {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        self.config = Some(decode_map(value)?);
        Ok(())
    }
}

#[async_trait]
impl Function for HttpFn {
    async fn invoke(&self, _ctx: &Context, input: Value) -> Result<Value> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("http fn".to_string()))?;

        let body = match input {
            Value::String(s) => s,
            other => {
                return Err(ConfigError::Shape {
                    target: "http fn input".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
        };

        let response = self
            .client
            .post(&config.target_url)
            .header(reqwest::header::CONTENT_TYPE, &config.content_type)
            .body(body)
            .send()
            .await
            .map_err(Error::io)?;

        let status = response.status();
        let output = response.text().await.map_err(Error::io)?;

        if status.as_u16() >= 400 {
            return Err(Error::message(ErrorKind::Invocation, output));
        }
        Ok(Value::String(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;

    async fn serve_echo() -> std::net::SocketAddr {
        let app = Router::new()
            .route("/echo", post(|body: String| async move { format!("echo: {body}") }))
            .route(
                "/fail",
                post(|| async { (axum::http::StatusCode::BAD_REQUEST, "bad input") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn configured(url: String) -> HttpFn {
        let mut f = HttpFn::new();
        let mut map = Map::new();
        map.insert("targetURL".to_string(), Value::String(url));
        common::configure(&mut f, Some(Value::Map(map))).unwrap();
        f
    }

    #[tokio::test]
    async fn posts_input_and_returns_body() {
        let addr = serve_echo().await;
        let f = configured(format!("http://{addr}/echo"));

        let out = f
            .invoke(&Context::background(), Value::from("hello"))
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some("echo: hello"));
    }

    #[tokio::test]
    async fn status_400_becomes_invocation_error() {
        let addr = serve_echo().await;
        let f = configured(format!("http://{addr}/fail"));

        let err = f
            .invoke(&Context::background(), Value::from("x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invocation);
        assert!(err.to_string().contains("bad input"));
    }

    #[tokio::test]
    async fn non_string_input_is_rejected() {
        let addr = serve_echo().await;
        let f = configured(format!("http://{addr}/echo"));

        let err = f
            .invoke(&Context::background(), Value::Map(Map::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }
}
