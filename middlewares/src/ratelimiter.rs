use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Configurable, Context, Function, Map, Middleware, Value};
use errors::{ConfigError, Error, Result};
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    refilled: Instant,
}

/// Token-bucket limiter: one token per `every`, holding at most `burst`.
/// Invocations wait for a token, honoring cancellation while they wait.
/// Defaults to one token per second with a burst of one.
pub struct RateLimiterMiddleware {
    burst: u32,
    every: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiterMiddleware {
    pub fn new() -> RateLimiterMiddleware {
        RateLimiterMiddleware::with_rate(1, Duration::from_secs(1))
    }

    pub fn with_rate(burst: u32, every: Duration) -> RateLimiterMiddleware {
        RateLimiterMiddleware {
            burst,
            every,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                refilled: Instant::now(),
            }),
        }
    }

    async fn acquire(&self, ctx: &Context) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.refilled);
                bucket.tokens = (bucket.tokens
                    + elapsed.as_secs_f64() / self.every.as_secs_f64())
                .min(self.burst as f64);
                bucket.refilled = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }
                self.every.mul_f64(1.0 - bucket.tokens)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.done() => return Err(ctx.error()),
            }
        }
    }
}

impl Default for RateLimiterMiddleware {
    fn default() -> Self {
        RateLimiterMiddleware::new()
    }
}

impl Configurable for RateLimiterMiddleware {
    fn configure_map(&mut self, mut value: Map) -> Result<()> {
        if let Some(burst) = value.remove("burst") {
            match burst {
                Value::Integer(n) if n >= 1 => self.burst = n as u32,
                Value::Integer(n) => {
                    return Err(Error::parse(format!("burst must be >= 1, got {n}")))
                }
                other => {
                    return Err(ConfigError::Shape {
                        target: "ratelimiter burst".to_string(),
                        shape: other.shape(),
                    }
                    .into())
                }
            }
        }
        if let Some(every) = value.remove("every") {
            match every {
                Value::String(s) => self.every = common::parse_duration(&s)?,
                other => {
                    return Err(ConfigError::Shape {
                        target: "ratelimiter every".to_string(),
                        shape: other.shape(),
                    }
                    .into())
                }
            }
        }
        self.bucket = Mutex::new(Bucket {
            tokens: self.burst as f64,
            refilled: Instant::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl Middleware for RateLimiterMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        self.acquire(ctx).await?;
        next.invoke(ctx, input).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::InvokeFunc;

    fn echo() -> Arc<dyn Function> {
        Arc::new(InvokeFunc::new(|_ctx: &Context, input| Ok(input)))
    }

    #[tokio::test(start_paused = true)]
    async fn burst_allows_immediate_calls_then_paces() {
        let limiter = RateLimiterMiddleware::with_rate(2, Duration::from_secs(1));
        let ctx = Context::background();

        let start = Instant::now();
        limiter.invoke(&ctx, Value::Null, echo()).await.unwrap();
        limiter.invoke(&ctx, Value::Null, echo()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.invoke(&ctx, Value::Null, echo()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_respects_cancellation() {
        let limiter = RateLimiterMiddleware::with_rate(1, Duration::from_secs(3600));
        let ctx = Context::background();
        limiter.invoke(&ctx, Value::Null, echo()).await.unwrap();

        let short = ctx.with_timeout(Duration::from_millis(50));
        let err = limiter.invoke(&short, Value::Null, echo()).await.unwrap_err();
        assert!(err.is_deadline_exceeded());
    }
}
