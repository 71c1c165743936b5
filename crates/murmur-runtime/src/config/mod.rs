//! Configuration module for the Murmur runtime.
//!
//! Configuration is layered with figment (defaults, files, `MURMUR_*`
//! environment variables, programmatic merges) and checked by
//! [`validate_config`] before the runtime uses it.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, MurmurConfig, SkillsConfig,
    SpanEventConfig,
};
pub use validation::validate_config;
