pub mod function;
pub mod middleware;
pub mod source;

pub use function::{Function, InvokeFunc};
pub use middleware::{Middleware, MiddlewareFn};
pub use source::Source;
