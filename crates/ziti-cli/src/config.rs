//! Configuration system for the Ziti CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ziti_core::{ContextConfig, ZitiIdentity};

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity to load
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Context tuning
    #[serde(default)]
    pub context: ContextSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Identity name
    #[serde(default = "default_identity_name")]
    pub name: String,
    /// Controller URL
    #[serde(default = "default_controller")]
    pub controller: String,
    /// Client certificate chain (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
    /// Trust anchors for controller and routers (PEM)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
}

/// Context tuning, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Delay between service refreshes
    #[serde(default = "default_refresh_secs")]
    pub refresh_interval_secs: u64,
    /// Wait for the first service list
    #[serde(default = "default_barrier_secs")]
    pub services_timeout_secs: u64,
    /// Wait for login
    #[serde(default = "default_barrier_secs")]
    pub active_timeout_secs: u64,
    /// Router connect and CONNECT exchange bound
    #[serde(default = "default_connect_secs")]
    pub connect_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_identity_name() -> String {
    "default".to_string()
}

fn default_controller() -> String {
    "https://localhost:1280".to_string()
}

fn default_refresh_secs() -> u64 {
    300
}

fn default_barrier_secs() -> u64 {
    30
}

fn default_connect_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_identity_name(),
            controller: default_controller(),
            cert: None,
            key: None,
            ca: None,
        }
    }
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_secs(),
            services_timeout_secs: default_barrier_secs(),
            active_timeout_secs: default_barrier_secs(),
            connect_timeout_secs: default_connect_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("ziti/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.identity.name.is_empty() {
            anyhow::bail!("Identity name must not be empty");
        }
        if !(self.identity.controller.starts_with("https://")
            || self.identity.controller.starts_with("http://"))
        {
            anyhow::bail!(
                "Controller URL must be http(s)://host:port, got {}",
                self.identity.controller
            );
        }

        let material = [&self.identity.cert, &self.identity.key, &self.identity.ca];
        let given = material.iter().filter(|p| p.is_some()).count();
        if given != 0 && given != material.len() {
            anyhow::bail!("cert, key and ca must be configured together");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.context_config().validate()?;
        Ok(())
    }

    /// Context configuration for the SDK
    #[must_use]
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            refresh_interval: Duration::from_secs(self.context.refresh_interval_secs),
            services_timeout: Duration::from_secs(self.context.services_timeout_secs),
            active_timeout: Duration::from_secs(self.context.active_timeout_secs),
            connect_timeout: Duration::from_secs(self.context.connect_timeout_secs),
            ..ContextConfig::default()
        }
    }

    /// Build the configured identity, reading PEM material if configured.
    ///
    /// # Errors
    ///
    /// Returns an error if a PEM file cannot be read or is unusable.
    pub fn load_identity(&self) -> anyhow::Result<ZitiIdentity> {
        let id = &self.identity;
        match (&id.cert, &id.key, &id.ca) {
            (Some(cert), Some(key), Some(ca)) => {
                let read = |p: &PathBuf| {
                    let path = expand_home(p);
                    fs::read(&path).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
                };
                Ok(ZitiIdentity::from_pem(
                    &id.name,
                    &id.controller,
                    &read(cert)?,
                    &read(key)?,
                    &read(ca)?,
                )?)
            }
            _ => Ok(ZitiIdentity::new(&id.name, &id.controller)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.identity.controller, "https://localhost:1280");
        assert_eq!(config.context.refresh_interval_secs, 300);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.identity.controller = "ctrl:1280".to_string();
        assert!(config.validate().is_err());

        config.identity.controller = default_controller();
        config.identity.cert = Some(PathBuf::from("cert.pem"));
        assert!(config.validate().is_err());

        config.identity.cert = None;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.context.refresh_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [identity]
            name = "alice"
            controller = "https://ctrl.example:1280"
            "#,
        )
        .unwrap();
        assert_eq!(config.identity.name, "alice");
        assert_eq!(config.context.connect_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.identity.name = "bob".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.identity.name, "bob");
        assert_eq!(loaded.context.services_timeout_secs, 30);
    }

    #[test]
    fn test_load_identity_without_material() {
        let config = Config::default();
        let identity = config.load_identity().unwrap();
        assert_eq!(identity.name(), "default");
        assert!(identity.tls_config().is_none());
    }

    #[test]
    fn test_load_identity_missing_file() {
        let mut config = Config::default();
        config.identity.cert = Some(PathBuf::from("/nonexistent/cert.pem"));
        config.identity.key = Some(PathBuf::from("/nonexistent/key.pem"));
        config.identity.ca = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(config.load_identity().is_err());
    }

    #[test]
    fn test_expand_home() {
        let plain = PathBuf::from("/etc/ziti.toml");
        assert_eq!(expand_home(&plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/x.pem")), home.join("x.pem"));
        }
    }
}
