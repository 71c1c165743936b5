//! Runtime error types.

use thiserror::Error;

use crate::config::ConfigError;
use murmur_framework::{LifecycleError, RegistrationError};

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The skill is listed in `skills.blacklist`.
    #[error("Skill '{0}' is blacklisted")]
    Blacklisted(String),

    /// A skill with this name is already loaded.
    #[error("Skill already loaded: {0}")]
    AlreadyLoaded(String),

    /// Binding or initializing a skill failed.
    #[error("Failed to load skill '{skill}': {source}")]
    Load {
        skill: String,
        #[source]
        source: RegistrationError,
    },

    /// Skill not found.
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A shutdown signal handler could not be installed.
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl RuntimeError {
    pub(crate) fn load(skill: impl Into<String>, source: impl Into<RegistrationError>) -> Self {
        Self::Load {
            skill: skill.into(),
            source: source.into(),
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
