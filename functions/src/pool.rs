//! Function that fans invocations into a fixed set of replica
//! functions, each handling at most one input at a time. Callers wait
//! up to `maxWait` for a free replica before failing with an
//! availability timeout.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{parse_duration, Configurable, Context, Function, Map, Registry, Value};
use errors::{ConfigError, Error, ErrorKind, Result};
use tokio::sync::Semaphore;

use crate::loader;

const DEFAULT_CONCURRENCY: usize = 8;
const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(500);

type Slots = Arc<Mutex<VecDeque<Arc<dyn Function>>>>;

struct Replicas {
    slots: Slots,
    available: Arc<Semaphore>,
}

/// Returns the leased replica to the pool when dropped, whatever path
/// the invocation took.
struct Lease {
    f: Option<Arc<dyn Function>>,
    slots: Slots,
    available: Arc<Semaphore>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            self.slots
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(f);
            self.available.add_permits(1);
        }
    }
}

pub struct PoolFn {
    registry: Arc<Registry>,
    max_wait: Duration,
    replicas: Option<Replicas>,
}

impl PoolFn {
    pub fn new(registry: Arc<Registry>) -> PoolFn {
        PoolFn {
            registry,
            max_wait: DEFAULT_MAX_WAIT,
            replicas: None,
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.replicas
            .as_ref()
            .map(|r| r.slots.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }
}

impl Configurable for PoolFn {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, mut value: Map) -> Result<()> {
        let concurrency = match value.remove("concurrency") {
            None => DEFAULT_CONCURRENCY,
            Some(Value::Integer(n)) if n >= 1 => n as usize,
            Some(Value::Integer(n)) => {
                return Err(Error::parse(format!("concurrency must be >= 1, got {n}")))
            }
            Some(other) => {
                return Err(ConfigError::Shape {
                    target: "pool concurrency".to_string(),
                    shape: other.shape(),
                }
                .into())
            }
        };

        if let Some(wait) = value.remove("maxWait") {
            match wait {
                Value::String(s) => self.max_wait = parse_duration(&s)?,
                other => {
                    return Err(ConfigError::Shape {
                        target: "pool maxWait".to_string(),
                        shape: other.shape(),
                    }
                    .into())
                }
            }
        }

        let template = value
            .remove("template")
            .ok_or(ConfigError::RequiredKey("template"))?;

        let mut slots = VecDeque::with_capacity(concurrency);
        for _ in 0..concurrency {
            let f = loader::load_template(&self.registry, template.clone())?;
            slots.push_back(Arc::from(f));
        }

        self.replicas = Some(Replicas {
            slots: Arc::new(Mutex::new(slots)),
            available: Arc::new(Semaphore::new(concurrency)),
        });
        Ok(())
    }
}

#[async_trait]
impl Function for PoolFn {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        let replicas = self
            .replicas
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("pool".to_string()))?;

        let permit = tokio::select! {
            permit = replicas.available.clone().acquire_owned() => {
                permit.map_err(|_| Error::message(ErrorKind::Io, "pool closed"))?
            }
            _ = tokio::time::sleep(self.max_wait) => {
                return Err(Error::message(
                    ErrorKind::AvailabilityTimeout,
                    "could not get access to a pooled fn before timeout",
                ));
            }
            _ = ctx.done() => return Err(ctx.error()),
        };
        permit.forget();

        let f = replicas
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let Some(f) = f else {
            replicas.available.add_permits(1);
            return Err(Error::message(ErrorKind::Io, "pool replica missing"));
        };

        let lease = Lease {
            f: Some(f.clone()),
            slots: replicas.slots.clone(),
            available: replicas.available.clone(),
        };

        let result = f.invoke(ctx, input).await;
        drop(lease);
        result
    }
}
