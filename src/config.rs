use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

/// Engine settings, read from `IOU_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Currency for new drafts when neither the policy nor the user has one.
    pub default_currency: String,
    pub log_level: String,
    /// When set, the store is persisted in sled at this path.
    pub store_path: Option<PathBuf>,
    pub violations_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            log_level: "info".to_string(),
            store_path: None,
            violations_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the process environment (and a `.env` file if present).
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_currency = match lookup("IOU_DEFAULT_CURRENCY") {
            Some(raw) => parse_currency("IOU_DEFAULT_CURRENCY", &raw)?,
            None => defaults.default_currency,
        };
        let log_level = lookup("IOU_LOG_LEVEL").unwrap_or(defaults.log_level);
        let store_path = lookup("IOU_STORE_PATH")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        let violations_enabled = match lookup("IOU_VIOLATIONS_ENABLED") {
            Some(raw) => parse_bool("IOU_VIOLATIONS_ENABLED", &raw)?,
            None => defaults.violations_enabled,
        };

        Ok(Self {
            default_currency,
            log_level,
            store_path,
            violations_enabled,
        })
    }
}

fn parse_bool(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: raw.to_string(),
        }),
    }
}

fn parse_currency(name: &'static str, raw: &str) -> Result<String, ConfigError> {
    let code = raw.trim().to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(ConfigError::InvalidCurrency {
            name,
            value: raw.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = EngineConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("IOU_DEFAULT_CURRENCY", "eur"),
            ("IOU_VIOLATIONS_ENABLED", "off"),
            ("IOU_STORE_PATH", "/tmp/iou"),
        ]))
        .unwrap();
        assert_eq!(config.default_currency, "EUR");
        assert!(!config.violations_enabled);
        assert_eq!(config.store_path, Some(PathBuf::from("/tmp/iou")));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_lookup(lookup_from(&[("IOU_VIOLATIONS_ENABLED", "maybe")])).is_err());
        assert!(EngineConfig::from_lookup(lookup_from(&[("IOU_DEFAULT_CURRENCY", "dollars")])).is_err());
    }
}
