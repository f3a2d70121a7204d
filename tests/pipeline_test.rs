//! End-to-end smoke test through the facade crate: a declarative
//! config is materialized into a running pipeline, driven by the cron
//! source, and shut down through context cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fnhost::prelude::*;

struct CountingFn {
    invocations: Arc<AtomicUsize>,
}

impl Configurable for CountingFn {}

#[async_trait::async_trait]
impl Function for CountingFn {
    async fn invoke(&self, _ctx: &Context, input: Value) -> Result<Value> {
        assert_eq!(input, Value::Map(Map::new()));
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(Value::from("done"))
    }
}

fn registry_with_counter(invocations: Arc<AtomicUsize>) -> Arc<Registry> {
    // Start from scratch rather than the default set so the test owns
    // every name it uses.
    let mut builder = RegistryBuilder::new();
    builder.register_fn_with_registry("fn", |registry| {
        Box::new(fnhost::prelude::functions::FnLoader::new(registry.clone()))
    });
    builder.register_middleware_with_registry("middleware", |registry| {
        Box::new(fnhost::prelude::middlewares::PipelineMiddleware::new(
            registry.clone(),
        ))
    });
    builder.register_source_with_registry("source", |registry| {
        Box::new(fnhost::prelude::sources::SourceLoader::new(registry.clone()))
    });
    builder.register_source("cron", || {
        Box::new(fnhost::prelude::sources::CronSource::new())
    });
    builder.register_middleware("timeout", || {
        Box::new(fnhost::prelude::middlewares::TimeoutMiddleware::new())
    });
    builder.register_fn("counter", move || {
        Box::new(CountingFn {
            invocations: invocations.clone(),
        })
    });
    builder.build()
}

#[tokio::test]
async fn declarative_pipeline_runs_until_cancelled() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let registry = registry_with_counter(invocations.clone());

    let yaml: serde_yaml::Value = serde_yaml::from_str(
        "{source: {cron: '@every 20ms'}, fn: counter, middleware: [{timeout: 5s}]}",
    )
    .unwrap();
    let config = Value::from_yaml(yaml);

    let supervisor = Supervisor::new(
        registry,
        SupervisorOptions {
            auto_restart: false,
            restart_wait: Duration::from_secs(1),
        },
    );

    let ctx = Context::background();
    let run_ctx = ctx.clone();
    let handle = tokio::spawn(async move { supervisor.run(&run_ctx, config).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    ctx.cancel();
    handle.await.unwrap().unwrap();

    assert!(invocations.load(Ordering::SeqCst) >= 2);
}
