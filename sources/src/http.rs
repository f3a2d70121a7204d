//! Web-server source. Every request is translated into an input map,
//! handed to the fn, and the output mapped back onto the response. The
//! listener is bound eagerly at configure time so bind errors surface
//! before serving starts and tests can read the chosen port.

use std::collections::HashMap;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, COOKIE, HOST};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::{
    decode_map, parse_duration, Configurable, Context, Function, Map, Source, Value,
};
use errors::{ConfigError, Error, ErrorKind, Result};
use hyper::body::Incoming;
use log::{error, warn};
use serde::Deserialize;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;

const DEFAULT_ADDRESS: &str = ":8080";
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpSourceConfig {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,
    #[serde(default)]
    base64_encode_body: bool,
    #[serde(default)]
    treat_output_as_body: bool,
    #[serde(default)]
    output_headers: HashMap<String, String>,
    #[serde(default)]
    ignore_output: bool,
    #[serde(default)]
    shutdown_grace_period: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseSpec {
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: String,
    #[serde(default)]
    status_code: u16,
}

struct HandlerState {
    ctx: Context,
    f: Arc<dyn Function>,
    base64_encode_body: bool,
    treat_output_as_body: bool,
    output_headers: HashMap<String, String>,
    ignore_output: bool,
}

pub struct HttpSource {
    cert_file: String,
    key_file: String,
    base64_encode_body: bool,
    treat_output_as_body: bool,
    output_headers: HashMap<String, String>,
    ignore_output: bool,
    grace_period: Duration,
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpSource {
    pub fn new() -> HttpSource {
        HttpSource {
            cert_file: String::new(),
            key_file: String::new(),
            base64_encode_body: false,
            treat_output_as_body: false,
            output_headers: HashMap::new(),
            ignore_output: false,
            grace_period: DEFAULT_GRACE_PERIOD,
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address; available after configuration.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bind(&self, address: &str) -> Result<()> {
        // ":8080" style addresses bind every interface.
        let address = if address.starts_with(':') {
            format!("0.0.0.0{address}")
        } else {
            address.to_string()
        };

        let listener = std::net::TcpListener::bind(&address)
            .map_err(|e| Error::with_message(ErrorKind::Io, format!("binding {address}"), Some(e)))?;
        listener.set_nonblocking(true)?;

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = listener.local_addr().ok();
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
        Ok(())
    }

    fn tls_enabled(&self) -> bool {
        !self.cert_file.is_empty() && !self.key_file.is_empty()
    }

    fn tls_config(&self) -> Result<rustls::ServerConfig> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut std::io::BufReader::new(
            std::fs::File::open(&self.cert_file)?,
        ))
        .collect::<std::io::Result<_>>()?;
        let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
            &self.key_file,
        )?))?
        .ok_or_else(|| Error::parse(format!("no private key found in {}", self.key_file)))?;

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::with_message(ErrorKind::Parse, "invalid TLS configuration", Some(e)))
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        HttpSource::new()
    }
}

impl Configurable for HttpSource {
    fn configure_empty(&mut self) -> Result<()> {
        self.bind(DEFAULT_ADDRESS)
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: HttpSourceConfig = decode_map(value)?;

        if cfg.cert_file.is_empty() != cfg.key_file.is_empty() {
            return Err(Error::message(
                ErrorKind::MissingConfig,
                "TLS requires both certFile and keyFile",
            ));
        }

        self.cert_file = cfg.cert_file;
        self.key_file = cfg.key_file;
        self.base64_encode_body = cfg.base64_encode_body;
        self.treat_output_as_body = cfg.treat_output_as_body;
        self.output_headers = cfg.output_headers;
        self.ignore_output = cfg.ignore_output;
        if let Some(grace) = cfg.shutdown_grace_period {
            self.grace_period = parse_duration(&grace)?;
        }

        self.bind(cfg.address.as_deref().unwrap_or(DEFAULT_ADDRESS))
    }
}

#[async_trait]
impl Source for HttpSource {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ConfigError::Missing("http source listener".to_string()))?;
        let listener = tokio::net::TcpListener::from_std(listener)?;

        let state = Arc::new(HandlerState {
            ctx: ctx.clone(),
            f,
            base64_encode_body: self.base64_encode_body,
            treat_output_as_body: self.treat_output_as_body,
            output_headers: self.output_headers.clone(),
            ignore_output: self.ignore_output,
        });
        let app = Router::new().fallback(handle).with_state(state);

        if self.tls_enabled() {
            return self.serve_tls(listener, app, ctx).await;
        }

        let shutdown = ctx.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.done().await })
        .into_future();
        let mut server = pin!(server);

        tokio::select! {
            result = &mut server => return result.map_err(Error::io),
            _ = ctx.done() => {}
        }

        match tokio::time::timeout(self.grace_period, &mut server).await {
            Ok(result) => result.map_err(Error::io),
            Err(_) => Err(Error::message(
                ErrorKind::Io,
                "graceful shutdown grace period elapsed",
            )),
        }
    }
}

impl HttpSource {
    async fn serve_tls(
        &self,
        listener: tokio::net::TcpListener,
        app: Router,
        ctx: &Context,
    ) -> Result<()> {
        let acceptor = TlsAcceptor::from(Arc::new(self.tls_config()?));

        loop {
            let (stream, peer) = tokio::select! {
                _ = ctx.done() => return Ok(()),
                accepted = listener.accept() => accepted.map_err(Error::io)?,
            };

            let acceptor = acceptor.clone();
            let app = app.clone();
            tokio::spawn(async move {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("TLS handshake with {peer} failed: {e}");
                        return;
                    }
                };

                let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                    let mut request = request.map(Body::new);
                    request.extensions_mut().insert(ConnectInfo(peer));
                    app.clone().oneshot(request)
                });

                let builder = hyper_util::server::conn::auto::Builder::new(
                    hyper_util::rt::TokioExecutor::new(),
                );
                let connection = builder
                    .serve_connection_with_upgrades(hyper_util::rt::TokioIo::new(stream), service);
                if let Err(e) = connection.await {
                    warn!("connection from {peer} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle(State(state): State<Arc<HandlerState>>, request: Request) -> Response {
    let input = match build_input(&state, request).await {
        Ok(input) => input,
        Err(e) => {
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let output = match state.f.invoke(&state.ctx, Value::Map(input)).await {
        Ok(output) => output,
        Err(e) => {
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    if state.treat_output_as_body {
        let spec = ResponseSpec {
            body: output.to_string(),
            ..ResponseSpec::default()
        };
        return write_response(&state, spec);
    }

    match output {
        Value::Map(map) => match decode_map::<ResponseSpec>(map) {
            Ok(spec) => write_response(&state, spec),
            Err(e) => {
                error!("invalid response map from fn: {e}");
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, String::new())
            }
        },
        other => {
            warn!("expected fn output to be a map but it was {}", other.shape());
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

async fn build_input(state: &HandlerState, request: Request) -> Result<Map> {
    let (parts, body) = request.into_parts();
    let mut input = Map::new();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    input.insert("host".to_string(), Value::from(host));

    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_default();
    input.insert("remoteAddress".to_string(), Value::String(remote));

    input.insert("method".to_string(), Value::String(parts.method.to_string()));
    input.insert(
        "protocol".to_string(),
        Value::from(parts.uri.scheme_str().unwrap_or_default()),
    );

    let content_length = parts
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);
    input.insert("contentLength".to_string(), Value::Integer(content_length));

    input.insert("url".to_string(), Value::String(parts.uri.to_string()));

    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::with_message(ErrorKind::Io, "reading request body", Some(e)))?;
    let body = if state.base64_encode_body {
        Value::String(BASE64.encode(&body))
    } else {
        Value::String(String::from_utf8_lossy(&body).into_owned())
    };
    input.insert("body".to_string(), body);

    let mut cookies = Map::new();
    for header in parts.headers.get_all(COOKIE) {
        if let Ok(header) = header.to_str() {
            for pair in header.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    cookies.insert(name.to_string(), Value::from(value));
                }
            }
        }
    }
    input.insert("cookies".to_string(), Value::Map(cookies));

    let mut headers = Map::new();
    for name in parts.headers.keys() {
        if name == &COOKIE {
            continue;
        }
        let values: Vec<Value> = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(Value::from)
            .collect();
        headers.insert(name.as_str().to_string(), Value::Sequence(values));
    }
    input.insert("headers".to_string(), Value::Map(headers));

    let mut query = Map::new();
    if let Some(raw) = parts.uri.query() {
        for (name, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            let entry = query
                .entry(name.into_owned())
                .or_insert_with(|| Value::Sequence(Vec::new()));
            if let Value::Sequence(values) = entry {
                values.push(Value::String(value.into_owned()));
            }
        }
    }
    input.insert("query".to_string(), Value::Map(query));

    Ok(input)
}

fn write_response(state: &HandlerState, spec: ResponseSpec) -> Response {
    let status = if spec.status_code == 0 {
        StatusCode::OK
    } else {
        match StatusCode::from_u16(spec.status_code) {
            Ok(status) => status,
            Err(_) => {
                error!("fn returned invalid status code {}", spec.status_code);
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, String::new());
            }
        }
    };

    let mut builder = Response::builder().status(status);
    let headers = if spec.headers.is_empty() {
        &state.output_headers
    } else {
        &spec.headers
    };
    for (name, value) in headers {
        match (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => {
                error!("fn returned invalid header {name}: {value}");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, String::new());
            }
        }
    }

    let body = if state.ignore_output {
        Body::empty()
    } else {
        Body::from(spec.body)
    };
    builder
        .body(body)
        .unwrap_or_else(|_| plain_response(StatusCode::INTERNAL_SERVER_ERROR, String::new()))
}

fn plain_response(status: StatusCode, body: String) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        })
}
