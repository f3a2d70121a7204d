use std::sync::Arc;

use async_trait::async_trait;
use common::{Configurable, Context, Function, Middleware, Value};
use errors::{ConfigError, Result};

/// Replaces a map input with the value under a single key. Any other
/// input shape fails without invoking the fn.
#[derive(Default)]
pub struct KeyMiddleware {
    key: String,
}

impl KeyMiddleware {
    pub fn new() -> KeyMiddleware {
        KeyMiddleware::default()
    }

    pub fn with_key(key: impl Into<String>) -> KeyMiddleware {
        KeyMiddleware { key: key.into() }
    }
}

impl Configurable for KeyMiddleware {
    fn configure_string(&mut self, value: String) -> Result<()> {
        self.key = value;
        Ok(())
    }
}

#[async_trait]
impl Middleware for KeyMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        match input {
            Value::Map(mut map) => {
                let selected = map.remove(&self.key).unwrap_or(Value::Null);
                next.invoke(ctx, selected).await
            }
            other => Err(ConfigError::Shape {
                target: "key middleware input".to_string(),
                shape: other.shape(),
            }
            .into()),
        }
    }
}
