use rollcall_core::provider::DEFAULT_EXTRACTOR_TIMEOUT;
use rollcall_core::DEFAULT_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the optional config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rollcall/rollcalld.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("bad config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    System,
    Session,
}

/// Daemon configuration: TOML file first, `ROLLCALL_*` variables on top.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Cosine similarity a detection must exceed to mark someone present.
    pub similarity_threshold: f32,
    /// Embedding extractor command line; the photo goes to its stdin.
    pub extractor: Vec<String>,
    /// Expected embedding dimension, checked on every extractor result.
    pub embedding_dim: Option<usize>,
    /// Seconds an extractor run may take before it is killed.
    pub extractor_timeout_secs: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("attendance.db"),
            similarity_threshold: DEFAULT_THRESHOLD,
            extractor: Vec::new(),
            embedding_dim: None,
            extractor_timeout_secs: DEFAULT_EXTRACTOR_TIMEOUT.as_secs(),
            bus: BusKind::System,
        }
    }
}

impl Config {
    /// Load `ROLLCALL_CONFIG` (or the default path, if present) and apply the
    /// process environment over it.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("ROLLCALL_CONFIG").map(PathBuf::from);
        let path = explicit
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if explicit.is_some() || path.exists() {
            let config = Self::from_file(&path)?;
            tracing::info!(path = %path.display(), "config file loaded");
            config
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&src)
    }

    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(src)?)
    }

    /// Apply `ROLLCALL_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SIMILARITY_THRESHOLD") {
            self.similarity_threshold = parse("ROLLCALL_SIMILARITY_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("ROLLCALL_EXTRACTOR") {
            self.extractor = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("ROLLCALL_EMBEDDING_DIM") {
            self.embedding_dim = Some(parse("ROLLCALL_EMBEDDING_DIM", v)?);
        }
        if let Some(v) = lookup("ROLLCALL_EXTRACTOR_TIMEOUT_SECS") {
            self.extractor_timeout_secs = parse("ROLLCALL_EXTRACTOR_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("ROLLCALL_BUS") {
            self.bus = match v.as_str() {
                "system" => BusKind::System,
                "session" => BusKind::Session,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "ROLLCALL_BUS",
                        value: v,
                    })
                }
            };
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.similarity_threshold, 0.49);
        assert!(config.extractor.is_empty());
        assert_eq!(config.embedding_dim, None);
        assert_eq!(config.extractor_timeout_secs, 30);
        assert_eq!(config.bus, BusKind::System);
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            db_path = "/var/lib/rollcall/attendance.db"
            extractor = ["/usr/libexec/rollcall-embed", "--model", "arcface"]
            bus = "session"
            "#,
        )
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/attendance.db"));
        assert_eq!(config.extractor.len(), 3);
        assert_eq!(config.bus, BusKind::Session);
        assert_eq!(config.similarity_threshold, 0.49);
    }

    #[test]
    fn test_from_toml_rejects_unknown_keys() {
        assert!(matches!(
            Config::from_toml("camera_device = \"/dev/video2\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("similarity_threshold = 0.55").unwrap();
        config
            .apply_overrides(env(&[
                ("ROLLCALL_SIMILARITY_THRESHOLD", "0.6"),
                ("ROLLCALL_EXTRACTOR", "python3  embed.py --json"),
                ("ROLLCALL_EMBEDDING_DIM", "512"),
                ("ROLLCALL_EXTRACTOR_TIMEOUT_SECS", "90"),
                ("ROLLCALL_BUS", "session"),
            ]))
            .unwrap();
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.extractor, vec!["python3", "embed.py", "--json"]);
        assert_eq!(config.embedding_dim, Some(512));
        assert_eq!(config.extractor_timeout_secs, 90);
        assert_eq!(config.bus, BusKind::Session);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("ROLLCALL_SIMILARITY_THRESHOLD", "high")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "ROLLCALL_SIMILARITY_THRESHOLD", .. }
        ));

        let err = config
            .apply_overrides(env(&[("ROLLCALL_BUS", "user")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "ROLLCALL_BUS", .. }));
    }
}
