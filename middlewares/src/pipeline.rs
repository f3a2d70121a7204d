//! Composes an ordered list of middlewares into a single middleware.
//! An empty list composes to the identity, which simply invokes the fn.
//! This is also the loader registered under the well-known name
//! `middleware`: its configuration is a sequence whose elements are bare
//! middleware names or single-entry `{name: sub-config}` maps.

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    configure, single_pair, Configurable, Context, Function, Middleware, MiddlewareFn, Registry,
    Value,
};
use errors::{ConfigError, Result};

pub struct IdentityMiddleware;

impl Configurable for IdentityMiddleware {}

#[async_trait]
impl Middleware for IdentityMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        next.invoke(ctx, input).await
    }
}

struct Composed {
    a: Arc<dyn Middleware>,
    b: Arc<dyn Middleware>,
}

#[async_trait]
impl Middleware for Composed {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let rest = Arc::new(MiddlewareFn::new(self.b.clone(), next));
        self.a.invoke(ctx, input, rest).await
    }
}

impl Configurable for Composed {}

/// Wraps right-to-left so that `compose([m1, m2])` invokes `m1` first.
pub fn compose(middlewares: Vec<Arc<dyn Middleware>>) -> Arc<dyn Middleware> {
    let mut current: Arc<dyn Middleware> = Arc::new(IdentityMiddleware);
    for middleware in middlewares.into_iter().rev() {
        current = Arc::new(Composed {
            a: middleware,
            b: current,
        });
    }
    current
}

pub struct PipelineMiddleware {
    registry: Arc<Registry>,
    middleware: Arc<dyn Middleware>,
}

impl PipelineMiddleware {
    pub fn new(registry: Arc<Registry>) -> PipelineMiddleware {
        PipelineMiddleware {
            registry,
            middleware: Arc::new(IdentityMiddleware),
        }
    }

    fn load(&self, name: &str, config: Option<Value>) -> Result<Arc<dyn Middleware>> {
        let mut middleware = self.registry.new_middleware(name)?;
        configure(middleware.as_mut(), config)?;
        Ok(Arc::from(middleware))
    }
}

impl Configurable for PipelineMiddleware {
    fn configure_sequence(&mut self, value: Vec<Value>) -> Result<()> {
        let mut middlewares = Vec::with_capacity(value.len());
        for element in value {
            let middleware = match element {
                Value::String(name) => self.load(&name, None)?,
                Value::Map(map) => {
                    let (name, config) = single_pair(map)?;
                    self.load(&name, Some(config))?
                }
                other => {
                    return Err(ConfigError::Shape {
                        target: "middleware configuration".to_string(),
                        shape: other.shape(),
                    }
                    .into())
                }
            };
            middlewares.push(middleware);
        }

        self.middleware = compose(middlewares);
        Ok(())
    }
}

#[async_trait]
impl Middleware for PipelineMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        self.middleware.invoke(ctx, input, next).await
    }
}
