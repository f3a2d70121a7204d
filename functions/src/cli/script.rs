use std::process::Stdio;

use common::{Context, Value};
use errors::{Error, ErrorKind, ProcessError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{log_stderr, CommandSpec};

/// One process per invocation: the input is written once to stdin, the
/// whole stdout is the output, stderr is logged.
pub(crate) struct Script {
    spec: CommandSpec,
}

impl Script {
    pub(crate) fn new(spec: CommandSpec) -> Script {
        Script { spec }
    }

    pub(crate) async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        let mut cmd = self.spec.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            command: self.spec.display(),
            source: e,
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stdin pipe unavailable"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stderr pipe unavailable"))?;

        let mut line = input.to_string();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::with_message(ErrorKind::Io, "writing stdin", Some(e)))?;
        drop(stdin);

        tokio::spawn(log_stderr(stderr));

        let reader = tokio::spawn(async move {
            let mut buffer = String::new();
            stdout.read_to_string(&mut buffer).await.map(|_| buffer)
        });

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|e| Error::with_message(ErrorKind::Io, "waiting for process", Some(e)))?;
                if !status.success() {
                    return Err(ProcessError::Exit(status.to_string()).into());
                }
                match reader.await {
                    Ok(Ok(output)) => Ok(Value::String(output)),
                    Ok(Err(e)) => Err(Error::with_message(ErrorKind::Io, "reading stdout", Some(e))),
                    Err(e) => Err(Error::with_message(ErrorKind::Io, "reading stdout", Some(e))),
                }
            }
            _ = ctx.done() => {
                let _ = child.start_kill();
                Err(ctx.error())
            }
        }
    }
}
