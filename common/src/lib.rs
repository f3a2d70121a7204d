pub mod config;
pub mod context;
pub mod interface;
pub mod model;
pub mod registry;

pub use config::{configure, decode_map, parse_duration, single_pair, Configurable};
pub use context::Context;
pub use interface::{Function, InvokeFunc, Middleware, MiddlewareFn, Source};
pub use model::{Map, Value};
pub use registry::{Registry, RegistryBuilder};
