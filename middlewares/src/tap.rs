use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Middleware, Value};
use errors::{Error, ErrorKind, ProcessError, Result};
use functions::CommandSpec;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Deserialize)]
struct TapConfig {
    command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default = "enabled")]
    #[serde(rename = "tapInput")]
    tap_input: bool,
    #[serde(default = "enabled")]
    #[serde(rename = "tapOutput")]
    tap_output: bool,
    #[serde(default = "enabled")]
    #[serde(rename = "tapError")]
    tap_error: bool,
}

fn enabled() -> bool {
    true
}

struct TapProc {
    alive: bool,
    stdin: Option<tokio::process::ChildStdin>,
}

/// Broadcasts inputs, outputs, and errors to a long-lived external
/// program over its stdin, fire-and-forget. The tapped process is
/// restarted on the next invocation if it exits; write failures are
/// ignored because tapping is best effort.
pub struct TapMiddleware {
    spec: Option<CommandSpec>,
    tap_input: bool,
    tap_output: bool,
    tap_error: bool,
    proc: Arc<RwLock<TapProc>>,
}

impl TapMiddleware {
    pub fn new() -> TapMiddleware {
        TapMiddleware {
            spec: None,
            tap_input: true,
            tap_output: true,
            tap_error: true,
            proc: Arc::new(RwLock::new(TapProc {
                alive: false,
                stdin: None,
            })),
        }
    }

    async fn start(&self, spec: &CommandSpec) -> Result<()> {
        if self.proc.read().await.alive {
            return Ok(());
        }

        let mut proc = self.proc.write().await;
        if proc.alive {
            return Ok(());
        }

        let mut cmd = spec.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            command: spec.display(),
            source: e,
        })?;

        proc.stdin = child.stdin.take();
        proc.alive = true;

        let shared = self.proc.clone();
        tokio::spawn(async move {
            let _ = child.wait().await;
            let mut proc = shared.write().await;
            proc.alive = false;
            proc.stdin = None;
        });

        Ok(())
    }

    async fn write_line(&self, text: String) {
        let mut proc = self.proc.write().await;
        if let Some(stdin) = proc.stdin.as_mut() {
            let mut line = text;
            line.push('\n');
            let _ = stdin.write_all(line.as_bytes()).await;
            let _ = stdin.flush().await;
        }
    }
}

impl Default for TapMiddleware {
    fn default() -> Self {
        TapMiddleware::new()
    }
}

impl Configurable for TapMiddleware {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.spec = Some(CommandSpec::parse(&value, &[])?);
        Ok(())
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: TapConfig = decode_map(value)?;
        self.spec = Some(CommandSpec::parse(&cfg.command, &cfg.env)?);
        self.tap_input = cfg.tap_input;
        self.tap_output = cfg.tap_output;
        self.tap_error = cfg.tap_error;
        Ok(())
    }
}

#[async_trait]
impl Middleware for TapMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let spec = self.spec.as_ref().ok_or_else(|| {
            Error::message(ErrorKind::UnconfiguredCommand, "tap: unconfigured command")
        })?;
        self.start(spec).await?;

        if self.tap_input {
            self.write_line(input.to_string()).await;
        }

        let result = next.invoke(ctx, input).await;

        match &result {
            Ok(output) => {
                if self.tap_output {
                    self.write_line(output.to_string()).await;
                }
            }
            Err(err) => {
                if self.tap_error {
                    self.write_line(err.to_string()).await;
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{configure, InvokeFunc};

    fn echo() -> Arc<dyn Function> {
        Arc::new(InvokeFunc::new(|_ctx: &Context, input| Ok(input)))
    }

    #[tokio::test]
    async fn taps_input_and_output_to_a_file() {
        let dir = std::env::temp_dir().join(format!("tap-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lines.txt");
        let path_str = path.to_str().unwrap();

        let mut middleware = TapMiddleware::new();
        configure(
            &mut middleware,
            Some(Value::String(format!("sh -c 'cat >> {path_str}'"))),
        )
        .unwrap();

        middleware
            .invoke(&Context::background(), Value::from("ping"), echo())
            .await
            .unwrap();

        // Fire-and-forget writes; give the process a moment to flush.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        assert!(contents.contains("ping"), "tap file was {contents:?}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unconfigured_tap_fails() {
        let middleware = TapMiddleware::new();
        let err = middleware
            .invoke(&Context::background(), Value::Null, echo())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnconfiguredCommand);
    }

    #[tokio::test]
    async fn fn_errors_still_propagate() {
        let mut middleware = TapMiddleware::new();
        configure(&mut middleware, Some(Value::from("cat"))).unwrap();

        let failing: Arc<dyn Function> = Arc::new(InvokeFunc::new(|_ctx: &Context, _input| {
            Err(Error::invocation("boom"))
        }));
        let err = middleware
            .invoke(&Context::background(), Value::Null, failing)
            .await
            .unwrap_err();
        assert!(err.is_invocation());
    }
}
