use std::sync::Arc;

use async_trait::async_trait;
use common::{configure, single_pair, Configurable, Context, Function, Map, Registry, Value};
use errors::{ConfigError, Result};

/// Instantiates and configures the named fn from the registry.
pub(crate) fn load(
    registry: &Arc<Registry>,
    name: &str,
    config: Option<Value>,
) -> Result<Box<dyn Function>> {
    let mut f = registry.new_fn(name)?;
    configure(f.as_mut(), config)?;
    Ok(f)
}

/// Resolves a function configuration that is either a bare name or a
/// single-entry `{name: sub-config}` map.
pub(crate) fn load_template(registry: &Arc<Registry>, template: Value) -> Result<Box<dyn Function>> {
    match template {
        Value::String(name) => load(registry, &name, None),
        Value::Map(map) => {
            let (name, config) = single_pair(map)?;
            load(registry, &name, Some(config))
        }
        other => Err(ConfigError::Shape {
            target: "fn configuration".to_string(),
            shape: other.shape(),
        }
        .into()),
    }
}

/// The well-known `fn` loader the runner bootstraps through.
pub struct FnLoader {
    registry: Arc<Registry>,
    f: Option<Arc<dyn Function>>,
}

impl FnLoader {
    pub fn new(registry: Arc<Registry>) -> FnLoader {
        FnLoader { registry, f: None }
    }
}

impl Configurable for FnLoader {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_string(&mut self, value: String) -> Result<()> {
        self.f = Some(Arc::from(load(&self.registry, &value, None)?));
        Ok(())
    }

    fn configure_map(&mut self, value: Map) -> Result<()> {
        let (name, config) = single_pair(value)?;
        self.f = Some(Arc::from(load(&self.registry, &name, Some(config))?));
        Ok(())
    }
}

#[async_trait]
impl Function for FnLoader {
    async fn invoke(&self, ctx: &Context, input: Value) -> Result<Value> {
        match &self.f {
            Some(f) => f.invoke(ctx, input).await,
            None => Err(ConfigError::Missing("fn loader".to_string()).into()),
        }
    }
}
