use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{decode_map, parse_duration, Configurable, Context, Function, Map, Middleware, Value};
use errors::{Error, ErrorKind, Result};
use log::warn;
use serde::Deserialize;

const TRIP_AFTER_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerState {
    state: State,
    consecutive_failures: u32,
    half_open_inflight: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    window_started: Instant,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BreakerConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    max_requests: Option<u32>,
    #[serde(default)]
    interval: Option<String>,
    #[serde(default)]
    timeout: Option<String>,
}

/// Closed/open/half-open circuit breaker around the fn.
///
/// Closed: invocations pass; five consecutive failures open the
/// circuit, and `interval` (when non-zero) periodically resets the
/// failure count. Open: invocations fail fast until `timeout` elapses,
/// then the breaker goes half-open. Half-open: up to `maxRequests`
/// probes may be in flight; any failure reopens, `maxRequests`
/// successes close.
pub struct CircuitBreakerMiddleware {
    name: String,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerMiddleware {
    pub fn new() -> CircuitBreakerMiddleware {
        CircuitBreakerMiddleware {
            name: String::new(),
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(60),
            state: Mutex::new(BreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                half_open_inflight: 0,
                half_open_successes: 0,
                opened_at: None,
                window_started: Instant::now(),
            }),
        }
    }

    fn admit(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if state.state == State::Open {
            let expired = state
                .opened_at
                .map(|at| now.duration_since(at) >= self.timeout)
                .unwrap_or(true);
            if expired {
                state.state = State::HalfOpen;
                state.half_open_inflight = 0;
                state.half_open_successes = 0;
            }
        }

        match state.state {
            State::Closed => {
                if !self.interval.is_zero()
                    && now.duration_since(state.window_started) >= self.interval
                {
                    state.consecutive_failures = 0;
                    state.window_started = now;
                }
                Ok(())
            }
            State::HalfOpen => {
                if state.half_open_inflight >= self.max_requests {
                    return Err(Error::message(
                        ErrorKind::CircuitOpen,
                        "circuit breaker is half-open and at capacity",
                    ));
                }
                state.half_open_inflight += 1;
                Ok(())
            }
            State::Open => Err(Error::message(
                ErrorKind::CircuitOpen,
                "circuit breaker is open",
            )),
        }
    }

    fn record(&self, success: bool) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.state {
            State::Closed => {
                if success {
                    state.consecutive_failures = 0;
                } else {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures > TRIP_AFTER_CONSECUTIVE_FAILURES {
                        state.state = State::Open;
                        state.opened_at = Some(Instant::now());
                        warn!(
                            "circuit breaker {:?} opened after {} consecutive failures",
                            self.name, state.consecutive_failures
                        );
                    }
                }
            }
            State::HalfOpen => {
                state.half_open_inflight = state.half_open_inflight.saturating_sub(1);
                if success {
                    state.half_open_successes += 1;
                    if state.half_open_successes >= self.max_requests {
                        state.state = State::Closed;
                        state.consecutive_failures = 0;
                        state.opened_at = None;
                        state.window_started = Instant::now();
                    }
                } else {
                    state.state = State::Open;
                    state.opened_at = Some(Instant::now());
                    warn!("circuit breaker {:?} reopened from half-open", self.name);
                }
            }
            // A probe admitted while half-open may report after another
            // failure already reopened the circuit.
            State::Open => {}
        }
    }
}

impl Default for CircuitBreakerMiddleware {
    fn default() -> Self {
        CircuitBreakerMiddleware::new()
    }
}

impl Configurable for CircuitBreakerMiddleware {
    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: BreakerConfig = decode_map(value)?;
        self.name = cfg.name;
        if let Some(max_requests) = cfg.max_requests {
            self.max_requests = max_requests.max(1);
        }
        if let Some(interval) = cfg.interval {
            self.interval = parse_duration(&interval)?;
        }
        if let Some(timeout) = cfg.timeout {
            self.timeout = parse_duration(&timeout)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        self.admit()?;
        let result = next.invoke(ctx, input).await;
        self.record(result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{configure, InvokeFunc};

    fn failing() -> Arc<dyn Function> {
        Arc::new(InvokeFunc::new(|_ctx: &Context, _input| {
            Err(Error::invocation("boom"))
        }))
    }

    fn echo() -> Arc<dyn Function> {
        Arc::new(InvokeFunc::new(|_ctx: &Context, input| Ok(input)))
    }

    fn breaker(config: &str) -> CircuitBreakerMiddleware {
        let mut m = CircuitBreakerMiddleware::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(config).unwrap();
        configure(&mut m, Some(Value::from_yaml(yaml))).unwrap();
        m
    }

    async fn trip(m: &CircuitBreakerMiddleware) {
        for _ in 0..=TRIP_AFTER_CONSECUTIVE_FAILURES {
            let err = m
                .invoke(&Context::background(), Value::Null, failing())
                .await
                .unwrap_err();
            assert!(err.is_invocation());
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_and_fails_fast() {
        let m = breaker("{name: test, timeout: 1h}");
        trip(&m).await;

        let err = m
            .invoke(&Context::background(), Value::Null, echo())
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn half_open_probe_closes_on_success() {
        let m = breaker("{timeout: 0s}");
        trip(&m).await;

        // timeout already elapsed, so the next call is a half-open probe.
        let out = m
            .invoke(&Context::background(), Value::from("ok"), echo())
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some("ok"));

        // And the breaker is closed again.
        m.invoke(&Context::background(), Value::Null, echo())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let m = breaker("{timeout: 0s}");
        trip(&m).await;

        m.invoke(&Context::background(), Value::Null, failing())
            .await
            .unwrap_err();
        // Reopened; with a zero timeout the next call is again a probe,
        // so check the internal state instead of the surface behavior.
        let state = m.state.lock().unwrap();
        assert_eq!(state.state, State::Open);
    }

    #[tokio::test]
    async fn successes_keep_the_breaker_closed() {
        let m = breaker("{}");
        for _ in 0..20 {
            m.invoke(&Context::background(), Value::Null, echo())
                .await
                .unwrap();
        }
    }
}
