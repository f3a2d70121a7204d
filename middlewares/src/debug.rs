use std::sync::Arc;

use async_trait::async_trait;
use common::{Configurable, Context, Function, Middleware, Value};
use errors::Result;
use log::info;

/// Logs inputs, outputs, and errors around the fn. May be configured
/// with a bool to toggle printing; defaults to enabled.
pub struct DebugMiddleware {
    print_enabled: bool,
}

impl DebugMiddleware {
    pub fn new() -> DebugMiddleware {
        DebugMiddleware {
            print_enabled: true,
        }
    }
}

impl Default for DebugMiddleware {
    fn default() -> Self {
        DebugMiddleware::new()
    }
}

impl Configurable for DebugMiddleware {
    fn configure_bool(&mut self, value: bool) -> Result<()> {
        self.print_enabled = value;
        Ok(())
    }
}

#[async_trait]
impl Middleware for DebugMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        if self.print_enabled {
            info!("debug middleware: handling input {input:?}");
        }

        let result = next.invoke(ctx, input).await;

        if self.print_enabled {
            match &result {
                Ok(output) => info!("debug middleware: received output {output:?}"),
                Err(err) => info!("debug middleware: received error {err}"),
            }
        }

        result
    }
}
