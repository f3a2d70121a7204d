// Common traits and types

pub use ::common::{
    configure, decode_map, parse_duration, single_pair, Configurable, Context, Function,
    InvokeFunc, Map, Middleware, MiddlewareFn, Registry, RegistryBuilder, Source, Value,
};

// Errors
pub use ::errors::{BoxError, ConfigError, Error, ErrorKind, ProcessError, Result};

// Runtime
pub use ::engine::{default_registry, load_config_file, Runner, Supervisor, SupervisorOptions};

pub mod functions {
    pub use ::functions::{CliFn, CommandSpec, FnLoader, HttpFn, IdentityFn, PoolFn};
}
pub mod middlewares {
    pub use ::middlewares::{
        compose, CircuitBreakerMiddleware, DebugMiddleware, HealthcheckMiddleware,
        IdentityMiddleware, JqMiddleware, JsonMiddleware, KafkaMiddleware, KeyMiddleware,
        PipelineMiddleware, RateLimiterMiddleware, TapMiddleware, TimeoutMiddleware,
    };
}
pub mod sources {
    pub use ::sources::{
        CronSource, HttpSource, KafkaSource, LambdaSource, ServiceBusSource, SourceLoader,
        SqsSource,
    };
}
