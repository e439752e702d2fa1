use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub collection: CollectionConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    #[serde(default = "DatabaseConfig::default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// How often the daemon asks every source whether it is due.
    pub tick_secs: u64,
    pub auth_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    /// Upper bound for one source's whole pipeline.
    pub run_timeout_secs: u64,
    pub expiration_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoIpConfig {
    /// Path to a MaxMind GeoLite2-Country or GeoLite2-City .mmdb file
    pub country_db_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Form POST login with a cookie session; paged CSV or HTML export.
    FormPortal,
    /// JSON login returning a bearer token; paged JSON list.
    TokenApi,
}

/// How fast a feed moves; decides which interval bounds apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    #[default]
    Slow,
    Fast,
}

impl Cadence {
    pub const fn interval_bounds(&self) -> (u32, u32) {
        match self {
            Cadence::Slow => (1, 365),
            Cadence::Fast => (1, 30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    #[serde(default = "SourceConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub cadence: Cadence,
    pub interval_days: u32,
    #[serde(default = "SourceConfig::default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "SourceConfig::default_lookback_days")]
    pub lookback_days: u32,
    #[serde(default = "SourceConfig::default_page_size")]
    pub page_size: u32,
    #[serde(default = "SourceConfig::default_max_pages")]
    pub max_pages: u32,
    pub base_url: String,
    #[serde(default)]
    pub credentials: Credentials,
}

/// Login pair supplied by the secrets collaborator. Never printed.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("interval for source '{name}' must be between {min} and {max} days, got {days}")]
    IntervalOutOfRange {
        name: String,
        days: i64,
        min: u32,
        max: u32,
    },
    #[error("unknown source '{0}'")]
    UnknownSource(String),
    #[error("invalid configuration for source '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("invalid setting 'collection.{key}': must be at least 1")]
    ZeroSetting { key: &'static str },
}

impl DatabaseConfig {
    const fn default_max_connections() -> u32 {
        5
    }
}

impl SourceConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_ttl_days() -> u32 {
        90
    }

    const fn default_lookback_days() -> u32 {
        90
    }

    const fn default_page_size() -> u32 {
        1000
    }

    const fn default_max_pages() -> u32 {
        50
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        validate_interval_days(name, i64::from(self.interval_days), self.cadence)?;

        let positive = [
            ("ttl_days", self.ttl_days),
            ("lookback_days", self.lookback_days),
            ("page_size", self.page_size),
            ("max_pages", self.max_pages),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name: name.to_string(),
                    reason: format!("{field} must be at least 1"),
                });
            }
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                name: name.to_string(),
                reason: format!("base_url '{}' is not an http(s) URL", self.base_url),
            });
        }

        Ok(())
    }
}

/// Bounds check used by config loading and by operator interval updates.
pub fn validate_interval_days(source: &str, days: i64, cadence: Cadence) -> Result<(), ConfigError> {
    let (min, max) = cadence.interval_bounds();
    if days < i64::from(min) || days > i64::from(max) {
        return Err(ConfigError::IntervalOutOfRange {
            name: source.to_string(),
            days,
            min,
            max,
        });
    }
    Ok(())
}

impl CollectionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Zero durations would spin the daemon loops or time out every run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = [
            ("tick_secs", self.tick_secs),
            ("auth_timeout_secs", self.auth_timeout_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("run_timeout_secs", self.run_timeout_secs),
            ("expiration_interval_secs", self.expiration_interval_secs),
        ];
        match settings.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::ZeroSetting { key }),
            None => Ok(()),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            tick_secs: 300,
            auth_timeout_secs: 30,
            fetch_timeout_secs: 60,
            run_timeout_secs: 300,
            expiration_interval_secs: 86_400,
        }
    }
}

impl Config {
    /// Load from `path` (or `BLACKWALL_CONFIG`, or `./blackwall.toml`), then
    /// apply `BLACKWALL__*` environment overrides.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("BLACKWALL_CONFIG").ok())
            .unwrap_or_else(|| "blackwall.toml".to_string());

        let defaults = CollectionConfig::default();
        let settings = ::config::Config::builder()
            .set_default("database.backend", "sqlite")?
            .set_default("database.url", "sqlite://./blackwall.db")?
            .set_default("database.max_connections", 5)?
            .set_default("collection.tick_secs", defaults.tick_secs)?
            .set_default("collection.auth_timeout_secs", defaults.auth_timeout_secs)?
            .set_default("collection.fetch_timeout_secs", defaults.fetch_timeout_secs)?
            .set_default("collection.run_timeout_secs", defaults.run_timeout_secs)?
            .set_default(
                "collection.expiration_interval_secs",
                defaults.expiration_interval_secs,
            )?
            .add_source(::config::File::from(Path::new(&path)).required(false))
            .add_source(
                ::config::Environment::with_prefix("BLACKWALL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {path}"))?;

        let config: Config = settings
            .try_deserialize()
            .context("configuration document is malformed")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.collection.validate()?;
        for (name, source) in &self.sources {
            source.validate(name)?;
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig, ConfigError> {
        self.sources
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSource(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[database]
backend = "sqlite"
url = "sqlite::memory:"

[collection]
tick_secs = 60

[sources.regtech]
kind = "form_portal"
interval_days = 90
base_url = "https://portal.example.org"
credentials = { username = "analyst", password = "hunter2" }

[sources.secudium]
kind = "token_api"
cadence = "fast"
interval_days = 3
ttl_days = 10
lookback_days = 3
base_url = "https://api.example.net"
"#;

    fn write_sample(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_from_file_applies_defaults() {
        let file = write_sample(SAMPLE);
        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.database.backend, DatabaseBackend::Sqlite);
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.collection.tick_secs, 60);
        assert_eq!(config.collection.run_timeout_secs, 300);

        let regtech = config.source("regtech").unwrap();
        assert_eq!(regtech.kind, SourceKind::FormPortal);
        assert!(regtech.enabled);
        assert_eq!(regtech.cadence, Cadence::Slow);
        assert_eq!(regtech.ttl_days, 90);
        assert_eq!(regtech.credentials.username, "analyst");

        let secudium = config.source("secudium").unwrap();
        assert_eq!(secudium.kind, SourceKind::TokenApi);
        assert_eq!(secudium.cadence, Cadence::Fast);
        assert_eq!(secudium.ttl_days, 10);
    }

    #[test]
    fn test_load_rejects_out_of_range_interval() {
        let file = write_sample(&SAMPLE.replace("interval_days = 3", "interval_days = 45"));
        let err = Config::load(file.path().to_str()).unwrap_err();
        let config_err = err.downcast_ref::<ConfigError>().unwrap();
        assert_eq!(
            config_err,
            &ConfigError::IntervalOutOfRange {
                name: "secudium".to_string(),
                days: 45,
                min: 1,
                max: 30,
            }
        );
    }

    #[test]
    fn test_load_rejects_zero_collection_settings() {
        let file = write_sample(&SAMPLE.replace("tick_secs = 60", "tick_secs = 0"));
        let err = Config::load(file.path().to_str()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroSetting { key: "tick_secs" })
        );

        let file = write_sample(&SAMPLE.replace(
            "tick_secs = 60",
            "tick_secs = 60\nexpiration_interval_secs = 0",
        ));
        let err = Config::load(file.path().to_str()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroSetting {
                key: "expiration_interval_secs"
            })
        );

        let collection = CollectionConfig {
            run_timeout_secs: 0,
            ..CollectionConfig::default()
        };
        assert_eq!(
            collection.validate(),
            Err(ConfigError::ZeroSetting {
                key: "run_timeout_secs"
            })
        );
        assert!(CollectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_interval_bounds_by_cadence() {
        assert!(validate_interval_days("a", 365, Cadence::Slow).is_ok());
        assert!(validate_interval_days("a", 366, Cadence::Slow).is_err());
        assert!(validate_interval_days("a", 0, Cadence::Slow).is_err());
        assert!(validate_interval_days("a", 30, Cadence::Fast).is_ok());
        assert!(validate_interval_days("a", 31, Cadence::Fast).is_err());
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials {
            username: "analyst".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("analyst"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_unknown_source() {
        let file = write_sample(SAMPLE);
        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(
            config.source("nope").unwrap_err(),
            ConfigError::UnknownSource("nope".to_string())
        );
    }
}
