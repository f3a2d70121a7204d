//! The runner owns one source and one fn, optionally wrapped by one
//! middleware, and drives the source until it returns. It bootstraps
//! through the three well-known loader names so that the declared
//! component names resolve against the registry.

use std::sync::Arc;

use common::{configure, Configurable, Context, Function, Map, MiddlewareFn, Registry, Source};
use errors::{ConfigError, Result};

pub struct Runner {
    registry: Arc<Registry>,
    source: Option<Box<dyn Source>>,
    f: Option<Arc<dyn Function>>,
}

impl Runner {
    pub fn new(registry: Arc<Registry>) -> Runner {
        Runner {
            registry,
            source: None,
            f: None,
        }
    }

    /// Drives the configured source with the configured fn.
    pub async fn run(&self, ctx: &Context) -> Result<()> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("runner".to_string()))?;
        let f = self
            .f
            .as_ref()
            .ok_or_else(|| ConfigError::Missing("runner".to_string()))?;
        source.serve(ctx, f.clone()).await
    }
}

impl Configurable for Runner {
    fn requires_config(&self) -> bool {
        true
    }

    fn configure_map(&mut self, mut value: Map) -> Result<()> {
        let source_config = value
            .remove("source")
            .ok_or(ConfigError::RequiredKey("source"))?;
        let fn_config = value.remove("fn").ok_or(ConfigError::RequiredKey("fn"))?;
        let middleware_config = value.remove("middleware");

        let mut f = self.registry.new_fn("fn")?;
        configure(f.as_mut(), Some(fn_config))?;
        let mut f: Arc<dyn Function> = Arc::from(f);

        if let Some(middleware_config) = middleware_config {
            let mut middleware = self.registry.new_middleware("middleware")?;
            configure(middleware.as_mut(), Some(middleware_config))?;
            f = Arc::new(MiddlewareFn::new(Arc::from(middleware), f));
        }

        let mut source = self.registry.new_source("source")?;
        configure(source.as_mut(), Some(source_config))?;

        self.f = Some(f);
        self.source = Some(source);
        Ok(())
    }
}
