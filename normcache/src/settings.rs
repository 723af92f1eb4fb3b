use crate::logger::Level;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

pub const ENV_PREFIX: &str = "NORMCACHE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
    Redb,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            "redb" => Ok(BackendKind::Redb),
            _ => Err(format!("Invalid value for BackendKind: {}", s)),
        }
    }
}

impl<'de> serde::Deserialize<'de> for BackendKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BackendKind::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CacheSettings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub normalization: NormalizationSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// Database file; required by the durable backends.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Hot records kept decoded in front of a durable backend, 0 disables the layer.
    #[serde(default)]
    pub lru_capacity: usize,
    #[serde(default)]
    pub vacuum_on_clear: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizationSettings {
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<String>,
    #[serde(default)]
    pub type_key_fields: HashMap<String, Vec<String>>,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self { key_fields: default_key_fields(), type_key_fields: HashMap::new() }
    }
}

fn default_key_fields() -> Vec<String> {
    vec!["id".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: Level,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: default_level() }
    }
}

fn default_level() -> Level {
    Level::Info
}

impl CacheSettings {
    /// Reads `path` and applies `NORMCACHE__SECTION__KEY` environment overrides.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder =
            Config::builder()
                .add_source(File::with_name(path).required(true))
                .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true).separator("__"));
        let settings = builder.build()?.try_deserialize::<CacheSettings>()?;
        log::debug!("{:#?}", settings);
        Ok(settings)
    }

    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        let mut settings = CacheSettings::default();
        settings.store.backend = BackendKind::Sqlite;
        settings.store.path = Some(path.into());
        settings
    }

    pub fn redb(path: impl Into<PathBuf>) -> Self {
        let mut settings = CacheSettings::default();
        settings.store.backend = BackendKind::Redb;
        settings.store.path = Some(path.into());
        settings
    }
}
