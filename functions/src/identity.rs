use async_trait::async_trait;
use common::{Configurable, Context, Function, Value};
use errors::Result;

/// Returns its input. Useful for testing and for pipelines where the
/// middlewares do all the work.
#[derive(Default)]
pub struct IdentityFn;

impl IdentityFn {
    pub fn new() -> IdentityFn {
        IdentityFn
    }
}

impl Configurable for IdentityFn {}

#[async_trait]
impl Function for IdentityFn {
    async fn invoke(&self, _ctx: &Context, input: Value) -> Result<Value> {
        Ok(input)
    }
}
