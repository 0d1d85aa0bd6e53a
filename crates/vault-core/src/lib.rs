pub mod config;
pub mod types;

pub use config::{ConfigError, FixtureConfig};
pub use types::*;
