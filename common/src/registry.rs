use std::collections::HashMap;
use std::sync::Arc;

use errors::{ConfigError, Result};

use crate::interface::{Function, Middleware, Source};

type SourceFactory = Box<dyn Fn(&Arc<Registry>) -> Box<dyn Source> + Send + Sync>;
type MiddlewareFactory = Box<dyn Fn(&Arc<Registry>) -> Box<dyn Middleware> + Send + Sync>;
type FnFactory = Box<dyn Fn(&Arc<Registry>) -> Box<dyn Function> + Send + Sync>;

/// Accumulates factory registrations and freezes them into a read-only
/// `Registry`. Registering the same key twice overwrites. Both factory
/// shapes (zero-argument and with-registry) are adapted to a single
/// internal shape that receives the registry at instantiation time.
#[derive(Default)]
pub struct RegistryBuilder {
    sources: HashMap<String, SourceFactory>,
    middlewares: HashMap<String, MiddlewareFactory>,
    functions: HashMap<String, FnFactory>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    pub fn register_source<F>(&mut self, key: &str, factory: F)
    where
        F: Fn() -> Box<dyn Source> + Send + Sync + 'static,
    {
        self.sources
            .insert(key.to_string(), Box::new(move |_| factory()));
    }

    pub fn register_source_with_registry<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&Arc<Registry>) -> Box<dyn Source> + Send + Sync + 'static,
    {
        self.sources.insert(key.to_string(), Box::new(factory));
    }

    pub fn register_middleware<F>(&mut self, key: &str, factory: F)
    where
        F: Fn() -> Box<dyn Middleware> + Send + Sync + 'static,
    {
        self.middlewares
            .insert(key.to_string(), Box::new(move |_| factory()));
    }

    pub fn register_middleware_with_registry<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&Arc<Registry>) -> Box<dyn Middleware> + Send + Sync + 'static,
    {
        self.middlewares.insert(key.to_string(), Box::new(factory));
    }

    pub fn register_fn<F>(&mut self, key: &str, factory: F)
    where
        F: Fn() -> Box<dyn Function> + Send + Sync + 'static,
    {
        self.functions
            .insert(key.to_string(), Box::new(move |_| factory()));
    }

    pub fn register_fn_with_registry<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&Arc<Registry>) -> Box<dyn Function> + Send + Sync + 'static,
    {
        self.functions.insert(key.to_string(), Box::new(factory));
    }

    pub fn build(self) -> Arc<Registry> {
        Arc::new(Registry {
            sources: self.sources,
            middlewares: self.middlewares,
            functions: self.functions,
        })
    }
}

/// Name → factory tables for the three component roles. Built once at
/// process start and read-only afterwards.
pub struct Registry {
    sources: HashMap<String, SourceFactory>,
    middlewares: HashMap<String, MiddlewareFactory>,
    functions: HashMap<String, FnFactory>,
}

impl Registry {
    pub fn new_source(self: &Arc<Self>, key: &str) -> Result<Box<dyn Source>> {
        match self.sources.get(key) {
            Some(factory) => Ok(factory(self)),
            None => Err(ConfigError::UnknownSource(key.to_string()).into()),
        }
    }

    pub fn new_middleware(self: &Arc<Self>, key: &str) -> Result<Box<dyn Middleware>> {
        match self.middlewares.get(key) {
            Some(factory) => Ok(factory(self)),
            None => Err(ConfigError::UnknownMiddleware(key.to_string()).into()),
        }
    }

    pub fn new_fn(self: &Arc<Self>, key: &str) -> Result<Box<dyn Function>> {
        match self.functions.get(key) {
            Some(factory) => Ok(factory(self)),
            None => Err(ConfigError::UnknownFn(key.to_string()).into()),
        }
    }

    pub fn has_source(&self, key: &str) -> bool {
        self.sources.contains_key(key)
    }

    pub fn has_middleware(&self, key: &str) -> bool {
        self.middlewares.contains_key(key)
    }

    pub fn has_fn(&self, key: &str) -> bool {
        self.functions.contains_key(key)
    }
}
