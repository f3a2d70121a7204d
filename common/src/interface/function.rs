use async_trait::async_trait;
use errors::Result;

use crate::config::Configurable;
use crate::context::Context;
use crate::model::Value;

/// A unit of application functionality. Implementations may hold the
/// logic directly or drive some external process that does.
#[async_trait]
pub trait Function: Configurable + Send + Sync {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value>;
}

/// Adapter that lets a plain closure stand in for a `Function`.
pub struct InvokeFunc<F>(F);

impl<F> InvokeFunc<F>
where
    F: Fn(&Context, Value) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        InvokeFunc(f)
    }
}

impl<F> Configurable for InvokeFunc<F> {}

#[async_trait]
impl<F> Function for InvokeFunc<F>
where
    F: Fn(&Context, Value) -> Result<Value> + Send + Sync,
{
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        (self.0)(ctx, input)
    }
}
