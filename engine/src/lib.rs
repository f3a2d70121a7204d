pub mod config_file;
pub mod registry;
pub mod runner;
pub mod supervisor;

pub use config_file::load_config_file;
pub use registry::default_registry;
pub use runner::Runner;
pub use supervisor::{Supervisor, SupervisorOptions};
