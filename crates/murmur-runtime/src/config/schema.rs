//! Configuration schema definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use murmur_framework::SkillOptions;
use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MurmurConfig {
    /// Language code handed to every skill.
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Skill loading and dispatch settings.
    #[serde(default)]
    pub skills: SkillsConfig,
}

impl Default for MurmurConfig {
    fn default() -> Self {
        Self {
            lang: default_lang(),
            logging: LoggingConfig::default(),
            skills: SkillsConfig::default(),
        }
    }
}

impl MurmurConfig {
    /// Builds the options for the skill named `name`.
    pub fn skill_options(&self, name: &str) -> SkillOptions {
        SkillOptions {
            lang: self.lang.clone(),
            base_dir: self.skills.skills_dir.join(name),
            data_dir: self.skills.data_dir.clone(),
            stop_threshold: self.skills.stop_threshold(),
            handler_timeout: self.skills.handler_timeout(),
        }
    }
}

fn default_lang() -> String {
    "en-us".to_string()
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    #[cfg(feature = "json-log")]
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How often the log file is rolled over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `murmur_framework = "debug"`.
    #[serde(default)]
    pub filters: BTreeMap<String, LogLevel>,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line in each record.
    #[serde(default)]
    pub file_location: bool,

    /// Target file when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,
}

// =============================================================================
// Skills
// =============================================================================

/// Skill loading and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Seconds after a stop request during which skills report `is_stop`.
    #[serde(default = "default_stop_threshold_secs")]
    pub stop_threshold_secs: f64,

    /// Execution limit for each handler and fallback candidate.
    #[serde(default = "default_handler_timeout_ms")]
    pub handler_timeout_ms: u64,

    /// Skill names that are never loaded.
    #[serde(default)]
    pub blacklist: Vec<String>,

    /// Root of per-skill scoped storage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Parent of every skill's base directory.
    #[serde(default = "default_skills_dir")]
    pub skills_dir: PathBuf,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            stop_threshold_secs: default_stop_threshold_secs(),
            handler_timeout_ms: default_handler_timeout_ms(),
            blacklist: Vec::new(),
            data_dir: default_data_dir(),
            skills_dir: default_skills_dir(),
        }
    }
}

impl SkillsConfig {
    /// Non-finite or negative thresholds clamp to zero; [`validate_config`](super::validate_config) rejects them.
    pub fn stop_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.stop_threshold_secs).unwrap_or(Duration::ZERO)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklist.iter().any(|b| b == name)
    }
}

fn default_stop_threshold_secs() -> f64 {
    2.0
}

fn default_handler_timeout_ms() -> u64 {
    30_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_skills_dir() -> PathBuf {
    PathBuf::from("skills")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skill_options_from_config() {
        let mut config = MurmurConfig::default();
        config.lang = "de-de".to_string();
        config.skills.stop_threshold_secs = 0.5;
        config.skills.handler_timeout_ms = 1500;

        let options = config.skill_options("weather");
        assert_eq!(options.lang, "de-de");
        assert_eq!(options.base_dir, PathBuf::from("skills").join("weather"));
        assert_eq!(options.data_dir, PathBuf::from("data"));
        assert_eq!(options.stop_threshold, Duration::from_millis(500));
        assert_eq!(options.handler_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_negative_threshold_clamps() {
        let skills = SkillsConfig {
            stop_threshold_secs: -1.0,
            ..Default::default()
        };
        assert_eq!(skills.stop_threshold(), Duration::ZERO);
    }

    #[test]
    fn test_level_deserializes_lowercase() {
        let config: LoggingConfig = serde_json::from_str(r#"{"level": "debug"}"#).unwrap();
        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.level.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(config.output, LogOutput::Stdout);
    }
}
