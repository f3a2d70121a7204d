use std::sync::Arc;

use async_trait::async_trait;
use common::{configure, single_pair, Configurable, Context, Function, Map, Registry, Source, Value};
use errors::{ConfigError, Result};

/// The well-known `source` loader the runner bootstraps through.
/// Accepts a bare source name or a single-entry `{name: sub-config}`
/// map.
pub struct SourceLoader {
    registry: Arc<Registry>,
    source: Option<Box<dyn Source>>,
}

impl SourceLoader {
    pub fn new(registry: Arc<Registry>) -> SourceLoader {
        SourceLoader {
            registry,
            source: None,
        }
    }

    fn load(&mut self, name: &str, config: Option<Value>) -> Result<()> {
        let mut source = self.registry.new_source(name)?;
        configure(source.as_mut(), config)?;
        self.source = Some(source);
        Ok(())
    }
}

impl Configurable for SourceLoader {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.load(&value, None)
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let (name, config) = single_pair(value)?;
        self.load(&name, Some(config))
    }
}

#[async_trait]
impl Source for SourceLoader {
    async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
        match &self.source {
            Some(source) => source.serve(ctx, f).await,
            None => Err(ConfigError::Missing("source loader".to_string()).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{InvokeFunc, RegistryBuilder};
    use errors::ErrorKind;

    struct OneShotSource {
        input: String,
    }

    impl Configurable for OneShotSource {
        fn configure_string(&mut self, value: String) -> Result<()> {
            self.input = value;
            Ok(())
        }
    }

    #[async_trait]
    impl Source for OneShotSource {
        async fn serve(&self, ctx: &Context, f: Arc<dyn Function>) -> Result<()> {
            f.invoke(ctx, Value::from(self.input.as_str())).await?;
            Ok(())
        }
    }

    fn registry() -> Arc<Registry> {
        let mut builder = RegistryBuilder::new();
        builder.register_source("oneshot", || {
            Box::new(OneShotSource {
                input: "default".to_string(),
            })
        });
        builder.build()
    }

    #[tokio::test]
    async fn loads_and_serves_named_source() {
        let mut loader = SourceLoader::new(registry());
        let mut map = Map::new();
        map.insert("oneshot".to_string(), Value::from("configured"));
        configure(&mut loader, Some(Value::Map(map))).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let f = Arc::new(InvokeFunc::new(move |_ctx: &Context, input: Value| {
            tx.send(input.to_string()).ok();
            Ok(Value::Null)
        }));

        loader.serve(&Context::background(), f).await.unwrap();
        assert_eq!(rx.recv().unwrap(), "configured");
    }

    #[tokio::test]
    async fn unknown_source_fails_configuration() {
        let mut loader = SourceLoader::new(registry());
        let err = configure(&mut loader, Some(Value::from("nope"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownName);
    }

    #[tokio::test]
    async fn requires_configuration() {
        let mut loader = SourceLoader::new(registry());
        let err = configure(&mut loader, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingConfig);
    }
}
