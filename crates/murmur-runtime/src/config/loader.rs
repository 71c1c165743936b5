//! Configuration loader using figment.
//!
//! # Feature Flags
//!
//! - `toml-config` *(default)*: enables TOML configuration files (`murmur.toml`, `config.toml`)
//! - `yaml-config`: enables YAML configuration files (`murmur.yaml`, `murmur.yml`)
//!
//! # Configuration Priority (lowest to highest)
//!
//! 1. Built-in defaults
//! 2. Programmatic merges
//! 3. Profile-specific config file (`murmur.{profile}.toml`)
//! 4. Main config file (`murmur.toml`)
//! 5. Environment variables (`MURMUR_*`)
//!
//! # Environment Variable Mapping
//!
//! Environment variables use the `MURMUR_` prefix with `__` as separator:
//!
//! - `MURMUR_LOGGING__LEVEL=debug` → `logging.level = "debug"`
//! - `MURMUR_SKILLS__HANDLER_TIMEOUT_MS=5000` → `skills.handler_timeout_ms = 5000`
//!
//! # Example
//!
//! ```rust,ignore
//! use murmur_runtime::config::ConfigLoader;
//!
//! let config = ConfigLoader::new()
//!     .profile("production")
//!     .file("./config/murmur.toml")
//!     .load()?;
//! ```

use std::path::{Path, PathBuf};

use figment::Figment;
#[cfg(any(feature = "yaml-config", feature = "toml-config"))]
use figment::providers::Format;
#[cfg(feature = "toml-config")]
use figment::providers::Toml;
#[cfg(feature = "yaml-config")]
use figment::providers::Yaml;
use figment::providers::{Env, Serialized};
use tracing::{debug, info, trace, warn};

use super::error::{ConfigError, ConfigResult};
use super::schema::MurmurConfig;
use super::validation::validate_config;

/// Configuration profile for environment-specific settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Profile {
    #[default]
    Development,
    Production,
    Custom(String),
}

impl Profile {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Custom(name) => name,
        }
    }

    /// Parses a profile name; `prod` and `dev` are accepted as aliases.
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "production" | "prod" => Self::Production,
            "development" | "dev" => Self::Development,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Reads `MURMUR_PROFILE`, defaulting to development.
    pub fn from_env() -> Self {
        std::env::var("MURMUR_PROFILE")
            .map(|p| Self::parse(&p))
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Configuration loader with figment-based multi-source support.
pub struct ConfigLoader {
    figment: Figment,
    profile: Profile,
    search_paths: Vec<PathBuf>,
    load_env: bool,
    /// Overrides the search when set.
    config_file: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            figment: Figment::new(),
            profile: Profile::from_env(),
            search_paths: Vec::new(),
            load_env: true,
            config_file: None,
        }
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.profile = Profile::parse(profile.as_ref());
        self
    }

    /// Adds a search path for configuration files.
    ///
    /// Without any search path the current directory and the user config
    /// directory (`~/.config/murmur`) are searched.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Sets a specific configuration file to load.
    pub fn file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    pub fn without_env(mut self) -> Self {
        self.load_env = false;
        self
    }

    /// Merges a configuration programmatically, above the defaults.
    pub fn merge(mut self, config: MurmurConfig) -> Self {
        self.figment = self.figment.merge(Serialized::defaults(config));
        self
    }

    /// Loads, extracts and validates the configuration.
    pub fn load(self) -> ConfigResult<MurmurConfig> {
        let profile = self.profile.clone();
        let figment = self.build_figment()?;

        let config: MurmurConfig = figment.extract().map_err(|e| {
            ConfigError::ParseError(format!("Failed to extract configuration: {e}"))
        })?;
        validate_config(&config)?;

        debug!(
            profile = %profile,
            logging_level = %config.logging.level,
            lang = %config.lang,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    fn build_figment(mut self) -> ConfigResult<Figment> {
        let mut figment = Figment::from(Serialized::defaults(MurmurConfig::default()));

        let user_figment = std::mem::take(&mut self.figment);
        figment = figment.merge(user_figment);

        if let Some(path) = &self.config_file {
            if path.exists() {
                info!(path = %path.display(), "Loading configuration file");
                figment = Self::merge_config_file(figment, path)?;
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        } else {
            figment = self.load_config_files(figment);
        }

        if self.load_env {
            trace!("Loading environment variables with MURMUR_ prefix");
            figment = figment.merge(
                Env::prefixed("MURMUR_")
                    .ignore(&["PROFILE"])
                    .split("__"),
            );
        }

        Ok(figment)
    }

    /// Dispatches on file extension. Only formats enabled via features are accepted.
    fn merge_config_file(figment: Figment, path: &Path) -> ConfigResult<Figment> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "toml-config")]
            "toml" => Ok(figment.merge(Toml::file(path))),
            #[cfg(feature = "yaml-config")]
            "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
            _ => Err(ConfigError::ParseError(format!(
                "Unsupported or disabled configuration file format: .{ext}"
            ))),
        }
    }

    fn resolve_search_paths(&self) -> Vec<PathBuf> {
        if !self.search_paths.is_empty() {
            return self.search_paths.clone();
        }
        let mut paths = Vec::new();
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd);
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("murmur"));
        }
        paths
    }

    /// Searches `search_paths × base_names` for one format.
    ///
    /// A profile-specific variant is merged before its base file; the search
    /// stops at the first base file found.
    #[cfg(any(feature = "toml-config", feature = "yaml-config"))]
    fn load_format_files<F>(
        &self,
        mut figment: Figment,
        search_paths: &[PathBuf],
        base_names: &[&str],
        merge_fn: F,
    ) -> (Figment, bool)
    where
        F: Fn(Figment, &Path) -> Figment,
    {
        for search_path in search_paths {
            for base_name in base_names {
                let Some((stem, ext)) = base_name.rsplit_once('.') else {
                    continue;
                };

                let profile_path =
                    search_path.join(format!("{stem}.{}.{ext}", self.profile.as_str()));
                if profile_path.exists() {
                    debug!(path = %profile_path.display(), "Loading profile-specific config");
                    figment = merge_fn(figment, &profile_path);
                }

                let base_path = search_path.join(base_name);
                if base_path.exists() {
                    info!(path = %base_path.display(), "Loading configuration file");
                    figment = merge_fn(figment, &base_path);
                    return (figment, true);
                }
            }
        }
        (figment, false)
    }

    fn load_config_files(&self, mut figment: Figment) -> Figment {
        let search_paths = self.resolve_search_paths();
        let mut found = false;

        #[cfg(feature = "toml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["murmur.toml", "config.toml"],
                |fig, path| fig.merge(Toml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        #[cfg(feature = "yaml-config")]
        {
            let (f, ok) = self.load_format_files(
                figment,
                &search_paths,
                &["murmur.yaml", "murmur.yml"],
                |fig, path| fig.merge(Yaml::file(path)),
            );
            figment = f;
            found |= ok;
        }

        if !found {
            warn!("No configuration file found, using defaults");
        }
        figment
    }
}

/// Loads configuration from the default locations.
pub fn load_config() -> ConfigResult<MurmurConfig> {
    ConfigLoader::new().load()
}

/// Loads configuration from `path`, with environment overrides.
pub fn load_config_from_file(path: impl AsRef<Path>) -> ConfigResult<MurmurConfig> {
    ConfigLoader::new().file(path).load()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.logging.level.as_str(), "info");
        assert_eq!(config.lang, "en-us");
        assert_eq!(config.skills.handler_timeout_ms, 30_000);
        assert!(config.skills.blacklist.is_empty());
    }

    #[test]
    fn test_profile_parse() {
        assert_eq!(Profile::parse("prod"), Profile::Production);
        assert_eq!(Profile::parse("DEV"), Profile::Development);
        assert_eq!(Profile::parse("kitchen"), Profile::Custom("kitchen".into()));
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = ConfigLoader::new()
            .file("/nonexistent/murmur.toml")
            .without_env()
            .load();
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_programmatic_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut overrides = MurmurConfig::default();
        overrides.lang = "fr-fr".to_string();
        let config = ConfigLoader::new()
            .search_path(dir.path())
            .without_env()
            .merge(overrides)
            .load()
            .unwrap();
        assert_eq!(config.lang, "fr-fr");
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_toml_file_with_profile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("murmur.toml"),
            "lang = \"en-gb\"\n[skills]\nblacklist = [\"jokes\"]\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("murmur.production.toml"),
            "[skills]\nhandler_timeout_ms = 5000\nblacklist = [\"news\"]\n",
        )
        .unwrap();

        let config = ConfigLoader::new()
            .search_path(dir.path())
            .profile("production")
            .without_env()
            .load()
            .unwrap();

        assert_eq!(config.lang, "en-gb");
        assert_eq!(config.skills.handler_timeout_ms, 5000);
        // The base file is merged last and wins.
        assert_eq!(config.skills.blacklist, vec!["jokes".to_string()]);
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.toml");
        std::fs::write(&path, "[skills]\nhandler_timeout_ms = 0\n").unwrap();

        let result = ConfigLoader::new().file(&path).without_env().load();
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("murmur.ini");
        std::fs::write(&path, "lang=en").unwrap();

        let result = ConfigLoader::new().file(&path).without_env().load();
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
