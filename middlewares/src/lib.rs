pub mod circuitbreaker;
pub mod debug;
pub mod healthcheck;
pub mod jq;
pub mod json;
pub mod kafka;
pub mod key;
pub mod pipeline;
pub mod ratelimiter;
pub mod tap;
pub mod timeout;

pub use circuitbreaker::CircuitBreakerMiddleware;
pub use debug::DebugMiddleware;
pub use healthcheck::HealthcheckMiddleware;
pub use jq::JqMiddleware;
pub use json::JsonMiddleware;
pub use kafka::KafkaMiddleware;
pub use key::KeyMiddleware;
pub use pipeline::{compose, IdentityMiddleware, PipelineMiddleware};
pub use ratelimiter::RateLimiterMiddleware;
pub use tap::TapMiddleware;
pub use timeout::TimeoutMiddleware;
