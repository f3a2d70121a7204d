use std::sync::Arc;
use std::time::Duration;

use common::{configure, Context, Registry, Value};
use errors::Result;
use log::{error, info};

use crate::runner::Runner;

#[derive(Clone, Debug)]
pub struct SupervisorOptions {
    /// Restart the runner when it returns an error.
    pub auto_restart: bool,
    /// How long to wait before a restart.
    pub restart_wait: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        SupervisorOptions {
            auto_restart: true,
            restart_wait: Duration::from_secs(10),
        }
    }
}

/// Owns the runner for the lifetime of the process: configures it from
/// the parsed config tree, runs it, and applies the restart policy
/// when a run ends with an error.
pub struct Supervisor {
    registry: Arc<Registry>,
    options: SupervisorOptions,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, options: SupervisorOptions) -> Supervisor {
        Supervisor { registry, options }
    }

    pub async fn run(&self, ctx: &Context, config: Value) -> Result<()> {
        let mut runner = Runner::new(self.registry.clone());
        configure(&mut runner, Some(config))?;

        loop {
            let result = runner.run(ctx).await;

            if ctx.is_done() {
                return result;
            }
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            if !self.options.auto_restart {
                return Err(err);
            }

            error!("runner returned error: {err}");
            info!(
                "restarting runner in {:?}",
                self.options.restart_wait
            );
            tokio::select! {
                _ = ctx.done() => return Ok(()),
                _ = tokio::time::sleep(self.options.restart_wait) => {}
            }
            info!("restarting runner...");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::{Configurable, Function, Map, RegistryBuilder, Source};
    use errors::{Error, ErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        attempts: Arc<AtomicUsize>,
    }

    impl Configurable for FlakySource {}

    #[async_trait]
    impl Source for FlakySource {
        async fn serve(&self, _ctx: &Context, _f: Arc<dyn Function>) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                return Err(Error::message(ErrorKind::Io, "transient failure"));
            }
            Ok(())
        }
    }

    fn registry(attempts: Arc<AtomicUsize>) -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_fn_with_registry("fn", |registry| {
            Box::new(functions::FnLoader::new(registry.clone()))
        });
        builder.register_source_with_registry("source", |registry| {
            Box::new(sources::SourceLoader::new(registry.clone()))
        });
        builder.register_fn("identity", || Box::new(functions::IdentityFn::new()));
        builder.register_source("flaky", move || {
            Box::new(FlakySource {
                attempts: attempts.clone(),
            })
        });
        builder.build()
    }

    fn config() -> Value {
        let mut map = Map::new();
        map.insert("source".to_string(), Value::from("flaky"));
        map.insert("fn".to_string(), Value::from("identity"));
        Value::Map(map)
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_until_the_source_succeeds() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(
            registry(attempts.clone()),
            SupervisorOptions {
                auto_restart: true,
                restart_wait: Duration::from_millis(10),
            },
        );

        supervisor
            .run(&Context::background(), config())
            .await
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn without_auto_restart_the_first_error_surfaces() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(
            registry(attempts.clone()),
            SupervisorOptions {
                auto_restart: false,
                restart_wait: Duration::from_secs(10),
            },
        );

        let err = supervisor
            .run(&Context::background(), config())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn configuration_errors_abort_before_serving() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let supervisor = Supervisor::new(
            registry(attempts.clone()),
            SupervisorOptions::default(),
        );

        let mut map = Map::new();
        map.insert("source".to_string(), Value::from("missing"));
        map.insert("fn".to_string(), Value::from("identity"));
        let err = supervisor
            .run(&Context::background(), Value::Map(map))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownName);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
