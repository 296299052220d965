//! Key/value configuration store.
//!
//! Configuration is a flat namespace of dotted keys such as
//! `RenderManager.Shadows.PSSM.Texture.Depth.Format`. Values are kept as
//! strings and converted on access, so a single store can feed every
//! subsystem that reads settings at start-up.
//!
//! The text format is one `Key = Value` pair per line. Blank lines and lines
//! starting with `;` or `#` are ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Errors raised while loading or converting configuration values.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    Io { path: PathBuf, source: std::io::Error },
    /// A line is not of the form `Key = Value`.
    Parse { line: usize, message: String },
    /// A value could not be converted to the requested type.
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            ConfigError::Parse { line, message } => {
                write!(f, "config parse error on line {}: {}", line, message)
            }
            ConfigError::InvalidValue { key, value, expected } => {
                write!(f, "config key '{}' has value '{}', expected {}", key, value, expected)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Ordered key/value configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigStore {
    entries: BTreeMap<String, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let mut store = Self::new();
        store.merge_str(text)?;
        Ok(store)
    }

    /// Loads a configuration file from disk.
    pub fn load_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let store = Self::parse(&text)?;
        tracing::debug!("Loaded {} config entries from {}", store.len(), path.display());
        Ok(store)
    }

    /// Parses `text` and overrides existing keys with its entries.
    pub fn merge_str(&mut self, text: &str) -> ConfigResult<()> {
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Parse {
                    line: index + 1,
                    message: format!("expected 'Key = Value', found '{}'", line),
                });
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::Parse {
                    line: index + 1,
                    message: "empty key".to_string(),
                });
            }

            self.entries.insert(key.to_string(), value.trim().to_string());
        }
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get_str(key).unwrap_or(default)
    }

    /// Strict boolean lookup. Accepts `yes/no`, `true/false`, `on/off` and `1/0`.
    pub fn try_get_bool(&self, key: &str) -> ConfigResult<Option<bool>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(Some(true)),
            "no" | "false" | "off" | "0" => Ok(Some(false)),
            _ => Err(self.invalid(key, value, "a boolean")),
        }
    }

    pub fn try_get_int(&self, key: &str) -> ConfigResult<Option<i64>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| self.invalid(key, value, "an integer"))
    }

    pub fn try_get_float(&self, key: &str) -> ConfigResult<Option<f32>> {
        let Some(value) = self.get_str(key) else {
            return Ok(None);
        };
        value
            .parse::<f32>()
            .map(Some)
            .map_err(|_| self.invalid(key, value, "a number"))
    }

    /// Lenient boolean lookup; malformed values fall back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.lenient(self.try_get_bool(key), default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.lenient(self.try_get_int(key), default)
    }

    pub fn get_float(&self, key: &str, default: f32) -> f32 {
        self.lenient(self.try_get_float(key), default)
    }

    /// Iterates over all entries whose key starts with `prefix`, in key order.
    pub fn enumerate<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.entries
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    fn invalid(&self, key: &str, value: &str, expected: &'static str) -> ConfigError {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }

    fn lenient<T>(&self, result: ConfigResult<Option<T>>, default: T) -> T {
        match result {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                tracing::warn!("{}; using default", err);
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
; shadow setup
RenderManager.Shadows.PSSM.Texture.Depth.Attachment = depth
RenderManager.Shadows.PSSM.Texture.Depth.Format = d32
# colour output
RenderManager.Shadows.PSSM.Texture.Color.Attachment = color0
RenderManager.Portals.MaxRecursion = 12
RenderManager.TextureCache.PowerOfTwo = yes
";

    #[test]
    fn test_parse_skips_comments_and_blank_lines() {
        let config = ConfigStore::parse(SAMPLE).unwrap();
        assert_eq!(config.len(), 5);
        assert_eq!(
            config.get_str("RenderManager.Shadows.PSSM.Texture.Depth.Format"),
            Some("d32")
        );
    }

    #[test]
    fn test_parse_rejects_line_without_separator() {
        let err = ConfigStore::parse("Good = 1\nbroken line\n").unwrap_err();
        match err {
            ConfigError::Parse { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_rejects_empty_key() {
        assert!(matches!(
            ConfigStore::parse(" = value"),
            Err(ConfigError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_typed_getters() {
        let config = ConfigStore::parse(SAMPLE).unwrap();
        assert_eq!(config.get_int("RenderManager.Portals.MaxRecursion", 30), 12);
        assert_eq!(config.get_int("Missing.Key", 30), 30);
        assert!(config.get_bool("RenderManager.TextureCache.PowerOfTwo", false));
        assert!(!config.get_bool("Missing.Key", false));
    }

    #[test]
    fn test_lenient_getter_falls_back_on_garbage() {
        let mut config = ConfigStore::new();
        config.set("Exposure", "bright");
        assert_eq!(config.get_float("Exposure", 0.5), 0.5);
        assert!(matches!(
            config.try_get_float("Exposure"),
            Err(ConfigError::InvalidValue { expected: "a number", .. })
        ));
    }

    #[test]
    fn test_enumerate_prefix_in_key_order() {
        let config = ConfigStore::parse(SAMPLE).unwrap();
        let keys: Vec<&str> = config
            .enumerate("RenderManager.Shadows.PSSM.Texture.")
            .map(|(key, _)| key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "RenderManager.Shadows.PSSM.Texture.Color.Attachment",
                "RenderManager.Shadows.PSSM.Texture.Depth.Attachment",
                "RenderManager.Shadows.PSSM.Texture.Depth.Format",
            ]
        );
    }

    #[test]
    fn test_merge_overrides_existing_keys() {
        let mut config = ConfigStore::parse("A = 1\nB = 2").unwrap();
        config.merge_str("B = 3\nC = 4").unwrap();
        assert_eq!(config.get_int("A", 0), 1);
        assert_eq!(config.get_int("B", 0), 3);
        assert_eq!(config.get_int("C", 0), 4);
    }
}
