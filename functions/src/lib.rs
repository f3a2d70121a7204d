pub mod cli;
pub mod http;
pub mod identity;
pub mod loader;
pub mod pool;

pub use cli::{CliFn, CommandSpec};
pub use http::HttpFn;
pub use identity::IdentityFn;
pub use loader::FnLoader;
pub use pool::PoolFn;
