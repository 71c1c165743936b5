//! Configuration validation utilities.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, MurmurConfig, SkillsConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &MurmurConfig) -> ConfigResult<()> {
    if config.lang.trim().is_empty() {
        return Err(ConfigError::validation("Language code cannot be empty"));
    }
    validate_logging_config(&config.logging)?;
    validate_skills_config(&config.skills)?;
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "File output requires logging.file_path",
        ));
    }

    for module in logging.filters.keys() {
        if module.is_empty() || module.contains(char::is_whitespace) {
            return Err(ConfigError::validation(format!(
                "Invalid log filter target: '{module}'"
            )));
        }
    }

    Ok(())
}

fn validate_skills_config(skills: &SkillsConfig) -> ConfigResult<()> {
    if skills.handler_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "Handler timeout must be greater than 0",
        ));
    }

    if !skills.stop_threshold_secs.is_finite() || skills.stop_threshold_secs < 0.0 {
        return Err(ConfigError::validation(format!(
            "Stop threshold must be a non-negative number of seconds, got {}",
            skills.stop_threshold_secs
        )));
    }

    let mut seen = HashSet::new();
    for name in &skills.blacklist {
        if !seen.insert(name) {
            return Err(ConfigError::DuplicateBlacklistEntry(name.clone()));
        }
    }

    Ok(())
}
