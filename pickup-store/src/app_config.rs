use chrono::Duration;
use config::ConfigError;
use pickup_order::LifecycleSettings;
use pickup_shared::Masked;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rules: LifecycleRules,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Masked<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,
}

fn default_max_connections() -> u32 { 5 }
fn default_acquire_timeout() -> u64 { 3 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// When false the in-process TTL cache is used instead
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topic: String,
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

fn default_app_name() -> String { "pickup-point".into() }

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_seconds: 300 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LifecycleRules {
    pub refund_window_hours: i64,
    pub workers: usize,
}

impl Default for LifecycleRules {
    fn default() -> Self {
        let defaults = LifecycleSettings::default();
        Self {
            refund_window_hours: defaults.refund_window.num_hours(),
            workers: defaults.workers,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Developer overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `PICKUP__DATABASE__URL=postgres://...`
            .add_source(config::Environment::with_prefix("PICKUP").separator("__"))
            .build()?;

        Self::from_sources(s)
    }

    /// Deserialize and reject durations that cannot be represented
    pub fn from_sources(sources: config::Config) -> Result<Self, ConfigError> {
        let cfg: Self = sources.try_deserialize()?;
        cfg.lifecycle_settings()?;
        cfg.cache_ttl()?;
        Ok(cfg)
    }

    pub fn lifecycle_settings(&self) -> Result<LifecycleSettings, ConfigError> {
        let hours = self.rules.refund_window_hours;
        let refund_window = Duration::try_hours(hours)
            .filter(|window| *window >= Duration::zero())
            .ok_or_else(|| {
                ConfigError::Message(format!("rules.refund_window_hours out of range: {hours}"))
            })?;

        Ok(LifecycleSettings {
            refund_window,
            workers: self.rules.workers.max(1),
        })
    }

    pub fn cache_ttl(&self) -> Result<Duration, ConfigError> {
        let secs = self.cache.ttl_seconds;
        i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| ConfigError::Message(format!("cache.ttl_seconds out of range: {secs}")))
    }
}
