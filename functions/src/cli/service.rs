use std::process::Stdio;
use std::sync::Arc;

use common::{Context, Value};
use errors::{Error, ErrorKind, ProcessError, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use super::{log_stderr, CommandSpec};

struct ProcState {
    alive: bool,
    stdin: Option<tokio::process::ChildStdin>,
    kill: Option<CancellationToken>,
}

/// One long-lived subprocess shared across invocations.
///
/// State machine: dead → (start) → alive → (exit | kill) → dead, with
/// transitions serialized under the write half of `state`. A stdout
/// reader task feeds `output`, a stderr reader logs, and a wait task
/// observes exit, flips `alive`, and reports the exit on `exits`.
pub(crate) struct Service {
    spec: CommandSpec,
    state: Arc<RwLock<ProcState>>,
    output: Mutex<mpsc::Receiver<String>>,
    output_tx: mpsc::Sender<String>,
    exits: Mutex<mpsc::Receiver<Error>>,
    exit_tx: mpsc::Sender<Error>,
}

impl Service {
    pub(crate) fn new(spec: CommandSpec) -> Service {
        let (output_tx, output_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = mpsc::channel(1);
        Service {
            spec,
            state: Arc::new(RwLock::new(ProcState {
                alive: false,
                stdin: None,
                kill: None,
            })),
            output: Mutex::new(output_rx),
            output_tx,
            exits: Mutex::new(exit_rx),
            exit_tx,
        }
    }

    async fn start(&self) -> Result<()> {
        if self.state.read().await.alive {
            return Ok(());
        }

        let mut state = self.state.write().await;
        if state.alive {
            return Ok(());
        }

        // A previous process may have exited with nobody waiting; its
        // stale exit report must not fail the next invocation.
        if let Ok(mut exits) = self.exits.try_lock() {
            while exits.try_recv().is_ok() {}
        }

        let mut cmd = self.spec.command();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            command: self.spec.display(),
            source: e,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stdin pipe unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stdout pipe unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::message(ErrorKind::Io, "stderr pipe unavailable"))?;

        let kill = CancellationToken::new();
        state.stdin = Some(stdin);
        state.kill = Some(kill.clone());
        state.alive = true;

        let output_tx = self.output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if output_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(log_stderr(stderr));

        let shared = self.state.clone();
        let exit_tx = self.exit_tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            {
                let mut state = shared.write().await;
                state.alive = false;
                state.stdin = None;
                state.kill = None;
            }

            let report = match status {
                Ok(status) if status.success() => ProcessError::EarlyExit.into(),
                Ok(status) => ProcessError::Exit(status.to_string()).into(),
                Err(e) => Error::io(e),
            };
            let _ = exit_tx.try_send(report);
        });

        Ok(())
    }

    /// Idempotent: flips the state to dead and signals the process; a
    /// process that already exited is not an error.
    async fn kill(&self) {
        let mut state = self.state.write().await;
        state.alive = false;
        state.stdin = None;
        if let Some(kill) = state.kill.take() {
            kill.cancel();
        }
    }

    pub(crate) async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        self.start().await?;

        {
            let mut state = self.state.write().await;
            match state.stdin.as_mut() {
                Some(stdin) => {
                    let mut line = input.to_string();
                    line.push('\n');
                    stdin
                        .write_all(line.as_bytes())
                        .await
                        .map_err(|e| Error::with_message(ErrorKind::Io, "writing stdin", Some(e)))?;
                    stdin
                        .flush()
                        .await
                        .map_err(|e| Error::with_message(ErrorKind::Io, "writing stdin", Some(e)))?;
                }
                None => return Err(ProcessError::EarlyExit.into()),
            }
        }

        let mut output = self.output.lock().await;
        let mut exits = self.exits.lock().await;

        tokio::select! {
            line = output.recv() => match line {
                Some(line) => Ok(Value::String(line)),
                None => Err(Error::message(ErrorKind::Io, "output channel closed")),
            },
            report = exits.recv() => {
                self.kill().await;
                Err(report.unwrap_or_else(|| ProcessError::EarlyExit.into()))
            }
            _ = ctx.done() => {
                self.kill().await;
                Err(ctx.error())
            }
        }
    }
}
