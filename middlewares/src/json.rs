use std::sync::Arc;

use async_trait::async_trait;
use common::{decode_map, Configurable, Context, Function, Map, Middleware, Value};
use errors::{ConfigError, Error, Result};
use serde::Deserialize;

#[derive(Clone, Copy, PartialEq)]
enum Strategy {
    None,
    Serialize,
    Deserialize,
}

impl Strategy {
    fn parse(s: &str) -> Result<Strategy> {
        match s {
            "" => Ok(Strategy::None),
            "serialize" => Ok(Strategy::Serialize),
            "deserialize" => Ok(Strategy::Deserialize),
            other => Err(Error::parse(format!("unknown json strategy {other:?}"))),
        }
    }
}

#[derive(Default, Deserialize)]
struct JsonConfig {
    #[serde(default)]
    input: String,
    #[serde(default)]
    output: String,
}

/// Transcodes the input before the fn and/or the output after it.
/// When the fn fails, the output is left untransformed and the error is
/// propagated.
pub struct JsonMiddleware {
    input: Strategy,
    output: Strategy,
}

impl JsonMiddleware {
    pub fn new() -> JsonMiddleware {
        JsonMiddleware {
            input: Strategy::None,
            output: Strategy::None,
        }
    }
}

impl Default for JsonMiddleware {
    fn default() -> Self {
        JsonMiddleware::new()
    }
}

fn transcode(value: Value, strategy: Strategy) -> Result<Value> {
    match strategy {
        Strategy::None => Ok(value),
        Strategy::Serialize => {
            let text = serde_json::to_string(&value.to_json())?;
            Ok(Value::String(text))
        }
        Strategy::Deserialize => match value {
            Value::String(text) => {
                let json: serde_json::Value = serde_json::from_str(&text)?;
                Ok(Value::from_json(json))
            }
            other => Err(ConfigError::Shape {
                target: "json deserialize input".to_string(),
                shape: other.shape(),
            }
            .into()),
        },
    }
}

impl Configurable for JsonMiddleware {
    fn configure_map(&mut self, value: Map) -> Result<()> {
        let cfg: JsonConfig = decode_map(value)?;
        self.input = Strategy::parse(&cfg.input)?;
        self.output = Strategy::parse(&cfg.output)?;
        Ok(())
    }
}

#[async_trait]
impl Middleware for JsonMiddleware {
    async fn invoke(&self, ctx: &Context, input: Value, next: Arc<dyn Function>) -> Result<Value> {
        let input = transcode(input, self.input)?;
        let output = next.invoke(ctx, input).await?;
        transcode(output, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{configure, InvokeFunc};
    use errors::ErrorKind;

    fn middleware(config: &str) -> JsonMiddleware {
        let mut m = JsonMiddleware::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str(config).unwrap();
        configure(&mut m, Some(Value::from_yaml(yaml))).unwrap();
        m
    }

    fn echo() -> Arc<dyn Function> {
        Arc::new(InvokeFunc::new(|_ctx: &Context, input| Ok(input)))
    }

    #[tokio::test]
    async fn deserializes_input() {
        let m = middleware("{input: deserialize}");
        let out = m
            .invoke(
                &Context::background(),
                Value::from(r#"{"a":{"b":42}}"#),
                echo(),
            )
            .await
            .unwrap();
        assert_eq!(out.get("a").get("b").as_i64(), Some(42));
    }

    #[tokio::test]
    async fn serializes_output() {
        let m = middleware("{output: serialize}");
        let mut map = Map::new();
        map.insert("a".to_string(), Value::from(1i64));
        let out = m
            .invoke(&Context::background(), Value::Map(map), echo())
            .await
            .unwrap();
        assert_eq!(out.as_str(), Some(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn deserializing_non_string_fails() {
        let m = middleware("{input: deserialize}");
        let err = m
            .invoke(&Context::background(), Value::from(1i64), echo())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
    }

    #[tokio::test]
    async fn fn_error_skips_output_transcoding() {
        let m = middleware("{output: deserialize}");
        let failing: Arc<dyn Function> = Arc::new(InvokeFunc::new(|_ctx: &Context, _input| {
            Err(Error::invocation("boom"))
        }));
        // The fn "output" is not a JSON string, so transcoding it would
        // fail differently; the invocation error must win.
        let err = m
            .invoke(&Context::background(), Value::Null, failing)
            .await
            .unwrap_err();
        assert!(err.is_invocation());
    }

    #[test]
    fn unknown_strategy_fails_configuration() {
        let mut m = JsonMiddleware::new();
        let yaml: serde_yaml::Value = serde_yaml::from_str("{input: gzip}").unwrap();
        let err = configure(&mut m, Some(Value::from_yaml(yaml))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }
}
