//! Function that runs an external command. In service mode one
//! long-lived process handles many inputs, one line in and one line out
//! per invocation, and is restarted if it exits. In script mode a fresh
//! process is started per invocation, fed the input on stdin, and its
//! whole stdout becomes the output. Either way stderr is consumed
//! line-by-line and logged.

mod script;
mod service;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Value};
use errors::{Error, ErrorKind, ProcessError, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use script::Script;
use service::Service;

/// The parsed command line plus extra environment entries. Spawns
/// inherit the parent environment with `env` appended.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn parse(command: &str, env: &[String]) -> Result<CommandSpec> {
        let words = split_command(command)?;
        let mut words = words.into_iter();
        let program = words.next().ok_or(ProcessError::EmptyCommand)?;

        let env = env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect();

        Ok(CommandSpec {
            program,
            args: words.collect(),
            env,
        })
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.kill_on_drop(true);
        cmd
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Splits a command string on whitespace, honoring single and double
/// quotes and backslash escapes.
fn split_command(command: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err(ProcessError::UnterminatedQuote(command.to_string()).into()),
            },
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        current.push(escaped);
                        in_word = true;
                    }
                    None => {
                        return Err(ProcessError::UnterminatedQuote(command.to_string()).into())
                    }
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote.is_some() {
        return Err(ProcessError::UnterminatedQuote(command.to_string()).into());
    }
    if in_word {
        words.push(current);
    }

    Ok(words)
}

/// Consumes a child stderr stream line-by-line into the log.
pub async fn log_stderr<R: AsyncRead + Unpin>(stream: R) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log::info!("{line}");
    }
}

enum Inner {
    Service(Service),
    Script(Script),
}

#[derive(Deserialize)]
struct CliConfig {
    command: String,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    script: bool,
}

/// The `cli` function. Must be configured with a command before use.
#[derive(Default)]
pub struct CliFn {
    inner: Option<Inner>,
}

impl CliFn {
    pub fn new() -> CliFn {
        CliFn::default()
    }
}

impl Configurable for CliFn {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        let spec = CommandSpec::parse(&value, &[])?;
        self.inner = Some(Inner::Service(Service::new(spec)));
        Ok(())
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: CliConfig = decode_map(value)?;
        let spec = CommandSpec::parse(&cfg.command, &cfg.env)?;
        self.inner = Some(if cfg.script {
            Inner::Script(Script::new(spec))
        } else {
            Inner::Service(Service::new(spec))
        });
        Ok(())
    }
}

#[async_trait]
impl Function for CliFn {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        match &self.inner {
            Some(Inner::Service(service)) => service.invoke(ctx, input).await,
            Some(Inner::Script(script)) => script.invoke(ctx, input).await,
            None => Err(Error::message(
                ErrorKind::UnconfiguredCommand,
                "cli: unconfigured command",
            )),
        }
    }
}
