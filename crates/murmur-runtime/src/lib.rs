//! # Murmur Runtime
//!
//! Hosts skills on a message bus:
//! - Layered configuration ([`config`]) with figment
//! - Logging setup ([`logging`]) on `tracing-subscriber`
//! - Skill loading, blacklisting and ordered teardown ([`SkillManager`])
//! - Signal-driven run loop ([`MurmurRuntime`])
//!
//! ```ignore
//! use std::sync::Arc;
//! use murmur_core::LocalBus;
//! use murmur_runtime::MurmurRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MurmurRuntime::new(Arc::new(LocalBus::new()));
//!     runtime.load_skill("weather", Weather).await?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, MurmurConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use manager::SkillManager;
pub use runtime::MurmurRuntime;

pub use tracing;
pub use tracing_subscriber;

/// Logging macros for skill authors.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
