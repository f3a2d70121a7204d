//! fnhost: unified entry point for the fnhost workspace.
//! This crate re-exports the internal crates so consumers can
//! `use fnhost::common::...`, `fnhost::sources::...`, etc.

pub mod prelude;

pub mod common {
    pub use ::common::*;
}
pub mod engine {
    pub use ::engine::*;
}
pub mod errors {
    pub use ::errors::*;
}
pub mod functions {
    pub use ::functions::*;
}
pub mod middlewares {
    pub use ::middlewares::*;
}
pub mod sources {
    pub use ::sources::*;
}
