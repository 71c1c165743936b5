//! # Murmur
//!
//! Skill event and intent dispatch for voice assistants.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  intent / event   ┌──────────────┐   adapted call   ┌──────────────┐
//! │ MessageBus │──────────────────▶│ EventBinding │─────────────────▶│ skill handler│
//! └────────────┘                   └──────────────┘                  └──────────────┘
//!       │ intent_failure           ┌──────────────────┐
//!       └─────────────────────────▶│ FallbackRegistry │──▶ fallbacks, lowest priority first
//!                                  └──────────────────┘
//! ```
//!
//! - **Core**: messages and the bus seam
//! - **Framework**: skills, event binding, intents, fallbacks, scheduling
//! - **Runtime**: configuration, logging, skill loading and teardown
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use murmur::prelude::*;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl SkillBehavior for Hello {
//!     fn declare(&self, decl: &mut Declarations) {
//!         decl.intent(
//!             IntentBuilder::new("hello").require("HelloKeyword"),
//!             |skill: Skill, _msg: Message| async move { skill.speak("Hi there", false).await },
//!         );
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = MurmurRuntime::new(Arc::new(LocalBus::new()));
//!     runtime.load_skill("hello", Hello).await?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: `murmur.toml` configuration files
//! - `yaml-config`: `murmur.yaml` configuration files
//! - `json-log`: JSON log output

pub use murmur_core as core;
pub use murmur_framework as framework;
pub use murmur_runtime as runtime;

/// Commonly used types for writing skills and hosting them.
pub mod prelude {
    pub use std::sync::Arc;

    pub use async_trait::async_trait;

    pub use murmur_core::{BoxedBus, LocalBus, Message, MessageBus, topic};
    pub use murmur_framework::{
        BoxError, Declarations, FallbackHandler, Intent, IntentBuilder, Skill, SkillBehavior,
        SkillOptions, SkillState, named, variadic,
    };
    pub use murmur_runtime::prelude::*;
    pub use murmur_runtime::{MurmurConfig, MurmurRuntime, RuntimeError, SkillManager};
}
