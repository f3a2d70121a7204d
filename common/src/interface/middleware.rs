use std::sync::Arc;

use async_trait::async_trait;
use errors::Result;

use crate::config::Configurable;
use crate::context::Context;
use crate::interface::function::Function;
use crate::model::Value;

/// A wrapper around a `Function` that may transform the input before
/// calling `next`, transform the output afterwards, short-circuit by not
/// calling `next`, or observe errors. When `next` fails, the error is
/// propagated untouched unless the middleware deliberately salvages it.
#[async_trait]
pub trait Middleware: Configurable + Send + Sync {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value>;
}

/// A `Function` formed by fixing a middleware around another function.
/// The composer and the runner both use this to collapse a middleware
/// chain into a single invocable.
pub struct MiddlewareFn {
    middleware: Arc<dyn Middleware>,
    f: Arc<dyn Function>,
}

impl MiddlewareFn {
    pub fn new(middleware: Arc<dyn Middleware>, f: Arc<dyn Function>) -> Self {
        MiddlewareFn { middleware, f }
    }
}

impl Configurable for MiddlewareFn {}

#[async_trait]
impl Function for MiddlewareFn {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        self.middleware.invoke(ctx, input, self.f.clone()).await
    }
}
