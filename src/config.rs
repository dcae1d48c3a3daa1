use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::{env, path::Path, path::PathBuf};
use tracing::{debug, info};

use crate::controller::ConcurrencyConfig;
use crate::endpoint::{BreakerConfig, EndpointConfig, PacingConfig, RateLimiter};
use crate::scheduler::{ExhaustedPolicy, SchedulerConfig};
use crate::transport::TransportConfig;

/// File name searched for in the working directory
pub const LOCAL_CONFIG_FILE: &str = "turnstile.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_endpoints")]
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            breaker: BreakerConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            transport: TransportConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
            endpoints: default_endpoints(),
        }
    }
}

/// The endpoint set written when no configuration exists:
///
/// | name | url | priority | base rate | range | hour / day / month |
/// |---|---|---|---|---|---|
/// | `cloudflare` | `https://cloudflare-eth.com` | 1 | 5 | 1–10 | unlimited |
/// | `llamarpc` | `https://eth.llamarpc.com` | 2 | 2 | 0.5–4 | 1000 / 10000 / unlimited |
#[must_use]
pub fn default_endpoints() -> BTreeMap<String, EndpointConfig> {
    BTreeMap::from([
        (
            "cloudflare".to_string(),
            EndpointConfig::new("https://cloudflare-eth.com", 5.0, [1.0, 10.0]).with_priority(1),
        ),
        (
            "llamarpc".to_string(),
            EndpointConfig::new("https://eth.llamarpc.com", 2.0, [0.5, 4.0])
                .with_priority(2)
                .with_limits(1_000, 10_000, -1),
        ),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// The `[logging]` section of the file at `path`, read before logging is installed.
    ///
    /// An absent or unparsable file yields the defaults; the full load reports
    /// the error once the subscriber is up.
    #[must_use]
    pub fn peek(path: &Path) -> Self {
        let mut logging = Config::from_file(path)
            .map(|config| config.logging)
            .unwrap_or_default();
        logging.apply_env();
        logging
    }

    fn apply_env(&mut self) {
        if let Ok(level) = env::var("TURNSTILE_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(format) = env::var("TURNSTILE_LOG_FORMAT") {
            self.format = format;
        }
    }
}

/// Values supplied on the command line, taking precedence over file and environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub min_concurrency: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub timeout_seconds: Option<u64>,
    pub on_exhausted: Option<ExhaustedPolicy>,
}

impl Config {
    /// Load configuration from a TOML file at the specified path
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The file cannot be read
    /// - The TOML content cannot be parsed into the Config structure
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Default location of the user's configuration file
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("turnstile")
            .join("config.toml")
    }

    /// First existing configuration file among the standard locations
    #[must_use]
    pub fn locate() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from(LOCAL_CONFIG_FILE),
            Self::default_path(),
            PathBuf::from("/etc/turnstile/config.toml"),
        ];
        candidates.into_iter().find(|path| {
            debug!("Checking for config at: {}", path.display());
            path.exists()
        })
    }

    /// The file to use: `explicit` if given, else the first standard location
    /// that exists, else [`default_path`](Self::default_path)
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(Self::locate)
            .unwrap_or_else(Self::default_path)
    }

    /// Load from `path`, first writing the default configuration there if it is absent.
    /// Environment overrides are applied and the result validated.
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - The default file cannot be created
    /// - The file cannot be read or parsed
    /// - An environment variable holds an invalid value
    /// - Validation fails
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "No config at {}, creating one with the default endpoints",
                path.display()
            );
            Self::default().write(path)?;
        }

        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        info!(
            "Loaded {} endpoints from {}",
            config.endpoints.len(),
            path.display()
        );
        Ok(config)
    }

    /// Serialize this configuration to `path`, creating parent directories
    ///
    /// # Errors
    ///
    /// This function will return an error if the directory or file cannot be written
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Apply `TURNSTILE_*` environment variables on top of the current values
    ///
    /// # Errors
    ///
    /// This function will return an error if a variable holds an unparsable value
    pub fn apply_env(&mut self) -> Result<()> {
        self.logging.apply_env();
        if let Ok(min) = env::var("TURNSTILE_MIN_CONCURRENCY") {
            self.concurrency.min_level = min
                .parse()
                .context("TURNSTILE_MIN_CONCURRENCY must be an integer")?;
        }
        if let Ok(max) = env::var("TURNSTILE_MAX_CONCURRENCY") {
            self.concurrency.max_level = max
                .parse()
                .context("TURNSTILE_MAX_CONCURRENCY must be an integer")?;
        }
        if let Ok(timeout) = env::var("TURNSTILE_TIMEOUT_SECONDS") {
            self.transport.timeout_seconds = timeout
                .parse()
                .context("TURNSTILE_TIMEOUT_SECONDS must be an integer")?;
        }
        Ok(())
    }

    /// Apply command line overrides
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(min) = overrides.min_concurrency {
            self.concurrency.min_level = min;
        }
        if let Some(max) = overrides.max_concurrency {
            self.concurrency.max_level = max;
        }
        if let Some(timeout) = overrides.timeout_seconds {
            self.transport.timeout_seconds = timeout;
        }
        if let Some(policy) = overrides.on_exhausted {
            self.scheduler.on_exhausted = policy;
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// This function will return an error if:
    /// - No endpoints are configured
    /// - An endpoint's rates or limits are invalid
    /// - Thresholds, factors or concurrency bounds are out of range
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            bail!("at least one endpoint must be configured");
        }
        for (name, endpoint) in &self.endpoints {
            endpoint.validate(name)?;
        }

        if self.pacing.increase_factor < 1.0 {
            bail!("pacing.increase_factor must be at least 1.0");
        }
        if self.pacing.decrease_factor <= 0.0 || self.pacing.decrease_factor > 1.0 {
            bail!("pacing.decrease_factor must be in (0, 1]");
        }

        if self.breaker.threshold == 0 {
            bail!("breaker.threshold must be greater than 0");
        }
        if self.breaker.cap_seconds < self.breaker.base_seconds {
            bail!("breaker.cap_seconds must not be below breaker.base_seconds");
        }

        let concurrency = &self.concurrency;
        if concurrency.min_level == 0 {
            bail!("concurrency.min_level must be greater than 0");
        }
        if concurrency.min_level > concurrency.max_level {
            return Err(anyhow!(
                "concurrency.min_level ({}) must not exceed concurrency.max_level ({})",
                concurrency.min_level,
                concurrency.max_level
            ));
        }
        if concurrency.success_threshold == 0 || concurrency.failure_threshold == 0 {
            bail!("concurrency thresholds must be greater than 0");
        }

        if self.transport.timeout_seconds == 0 {
            bail!("transport.timeout_seconds must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            bail!("logging.format must be \"text\" or \"json\"");
        }

        Ok(())
    }

    /// One rate limiter per configured endpoint
    #[must_use]
    pub fn build_limiters(&self) -> Vec<Arc<RateLimiter>> {
        self.endpoints
            .iter()
            .map(|(name, endpoint)| {
                Arc::new(RateLimiter::new(
                    name.clone(),
                    endpoint,
                    self.pacing.clone(),
                    self.breaker.clone(),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.breaker.threshold, 2);
        assert_eq!(config.breaker.base_seconds, 60);
        assert_eq!(config.breaker.cap_seconds, 600);
        assert_eq!(config.concurrency.min_level, 1);
        assert_eq!(config.concurrency.max_level, 8);
        assert_eq!(config.concurrency.success_threshold, 20);
        assert_eq!(config.concurrency.failure_threshold, 3);
        assert_eq!(config.transport.throttle_statuses, vec![429]);
        assert_eq!(config.scheduler.checkpoint_interval, 50);
    }

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_failures() {
        let mut config = Config::default();
        config.endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.concurrency.min_level = 5;
        config.concurrency.max_level = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.concurrency.min_level = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pacing.decrease_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.breaker.threshold = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.format = "yaml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply(&ConfigOverrides {
            min_concurrency: Some(2),
            max_concurrency: Some(4),
            timeout_seconds: Some(3),
            on_exhausted: Some(ExhaustedPolicy::Drop),
        });
        assert_eq!(config.concurrency.min_level, 2);
        assert_eq!(config.concurrency.max_level, 4);
        assert_eq!(config.transport.timeout_seconds, 3);
        assert_eq!(config.scheduler.on_exhausted, ExhaustedPolicy::Drop);
    }

    #[test]
    fn test_write_creates_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("config.toml");
        Config::default().write(&path).unwrap();
        assert_eq!(Config::from_file(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_peek_logging() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert_eq!(LoggingConfig::peek(&path), LoggingConfig::default());
        assert!(!path.exists());

        std::fs::write(&path, "[logging]\nlevel = \"warn\"\nformat = \"json\"\n").unwrap();
        let logging = LoggingConfig::peek(&path);
        assert_eq!(logging.level, "warn");
        assert_eq!(logging.format, "json");
    }

    #[test]
    fn test_resolve_prefers_explicit_path() {
        let explicit = PathBuf::from("/tmp/elsewhere/turnstile.toml");
        assert_eq!(Config::resolve_path(Some(&explicit)), explicit);
    }

    #[test]
    fn test_build_limiters() {
        let limiters = Config::default().build_limiters();
        let names: Vec<_> = limiters.iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["cloudflare", "llamarpc"]);
    }
}
