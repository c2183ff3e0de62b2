//! Configuration loading for medman.
//!
//! [`ConfigLoader`] reads an optional `.env` file, one configuration document
//! (TOML or JSON) and environment overrides, and reports which source won.

pub mod error;
pub mod loader;
pub mod sources;
pub mod util;

pub use error::ConfigLoadError;
pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions};
pub use sources::{ConfigSource, EnvConfig};
