use std::sync::Arc;

use async_trait::async_trait;
use errors::Result;

use crate::config::Configurable;
use crate::context::Context;
use crate::interface::function::Function;

/// An input producer. `serve` drives `f` with inputs until the context
/// is done or the source hits an unrecoverable error, then returns.
#[async_trait]
pub trait Source: Configurable + Send + Sync {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()>;
}
