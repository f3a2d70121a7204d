use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{parse_duration, Configurable, Context, Function, Middleware, Value};
use errors::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Derives a child context with a deadline around `next`. Configured
/// with a duration string; defaults to 30s.
pub struct TimeoutMiddleware {
    duration: Duration,
}

impl TimeoutMiddleware {
    pub fn new() -> TimeoutMiddleware {
        TimeoutMiddleware::with_duration(DEFAULT_TIMEOUT)
    }

    pub fn with_duration(duration: Duration) -> TimeoutMiddleware {
        TimeoutMiddleware { duration }
    }
}

impl Default for TimeoutMiddleware {
    fn default() -> Self {
        TimeoutMiddleware::new()
    }
}

impl Configurable for TimeoutMiddleware {
    fn configure_string(&mut self, value: String) -> Result<()> {
        self.duration = parse_duration(&value)?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let ctx = ctx.with_timeout(self.duration);
        next.invoke(&ctx, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::configure;

    struct WaitForCtx;

    impl Configurable for WaitForCtx {}

    #[async_trait]
    impl Function for WaitForCtx {
        async fn invoke(&self, ctx: &Context, _input: Value) -> Result<Value> {
            ctx.done().await;
            Err(ctx.error())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reaches_the_fn() {
        let mut middleware = TimeoutMiddleware::new();
        configure(&mut middleware, Some(Value::from("50ms"))).unwrap();

        let err = middleware
            .invoke(&Context::background(), Value::Null, Arc::new(WaitForCtx))
            .await
            .unwrap_err();
        assert!(err.is_deadline_exceeded());
    }

    #[test]
    fn bad_duration_fails_configuration() {
        let mut middleware = TimeoutMiddleware::new();
        assert!(configure(&mut middleware, Some(Value::from("fast"))).is_err());
    }
}
