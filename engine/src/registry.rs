use std::sync::Arc;

use common::{Registry, RegistryBuilder};

/// Builds the registry with every built-in source, middleware, and fn
/// under its well-known name, plus the three loaders the runner
/// bootstraps through.
pub fn default_registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();

    builder.register_fn("cli", || Box::new(functions::CliFn::new()));
    builder.register_fn("http", || Box::new(functions::HttpFn::new()));
    builder.register_fn("identity", || Box::new(functions::IdentityFn::new()));
    builder.register_fn_with_registry("pool", |registry| {
        Box::new(functions::PoolFn::new(registry.clone()))
    });
    builder.register_fn_with_registry("fn", |registry| {
        Box::new(functions::FnLoader::new(registry.clone()))
    });

    builder.register_middleware("circuitbreaker", || {
        Box::new(middlewares::CircuitBreakerMiddleware::new())
    });
    builder.register_middleware("debug", || Box::new(middlewares::DebugMiddleware::new()));
    builder.register_middleware("healthcheck", || {
        Box::new(middlewares::HealthcheckMiddleware::new())
    });
    builder.register_middleware("jq", || Box::new(middlewares::JqMiddleware::new()));
    builder.register_middleware("json", || Box::new(middlewares::JsonMiddleware::new()));
    builder.register_middleware("kafka", || Box::new(middlewares::KafkaMiddleware::new()));
    builder.register_middleware("key", || Box::new(middlewares::KeyMiddleware::new()));
    builder.register_middleware("ratelimiter", || {
        Box::new(middlewares::RateLimiterMiddleware::new())
    });
    builder.register_middleware("tap", || Box::new(middlewares::TapMiddleware::new()));
    builder.register_middleware("timeout", || Box::new(middlewares::TimeoutMiddleware::new()));
    builder.register_middleware_with_registry("middleware", |registry| {
        Box::new(middlewares::PipelineMiddleware::new(registry.clone()))
    });

    builder.register_source("azure/servicebus", || {
        Box::new(sources::ServiceBusSource::new())
    });
    builder.register_source("cron", || Box::new(sources::CronSource::new()));
    builder.register_source("http", || Box::new(sources::HttpSource::new()));
    builder.register_source("kafka", || Box::new(sources::KafkaSource::new()));
    builder.register_source("lambda", || Box::new(sources::LambdaSource::new()));
    builder.register_source("sqs", || Box::new(sources::SqsSource::new()));
    builder.register_source_with_registry("source", |registry| {
        Box::new(sources::SourceLoader::new(registry.clone()))
    });

    builder.build()
}
