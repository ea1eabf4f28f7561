//! Runtime settings read from the environment (after `dotenvy::dotenv()`).

use crate::error::ConfigError;
use crate::query::OperatorPolicy;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_PAGE_SIZE: u64 = 100;
pub const MAX_PAGE_SIZE: u64 = 200;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Settings {
    pub bind: String,
    /// PostgreSQL store when set, in-memory store otherwise.
    pub database_url: Option<String>,
    pub schema_path: PathBuf,
    pub media_root: PathBuf,
    pub page_size: u64,
    pub max_page_size: u64,
    pub max_upload_bytes: usize,
    /// Fail on unsupported filter operators instead of skipping the condition.
    pub reject_unknown_operators: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind: "127.0.0.1:3000".into(),
            database_url: None,
            schema_path: PathBuf::from("entities.json"),
            media_root: PathBuf::from("./media"),
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            reject_unknown_operators: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Ok(Settings {
            bind: get("ENGINE_BIND").unwrap_or(defaults.bind),
            database_url: get("DATABASE_URL"),
            schema_path: get("ENGINE_SCHEMA_PATH").map(PathBuf::from).unwrap_or(defaults.schema_path),
            media_root: get("ENGINE_MEDIA_ROOT").map(PathBuf::from).unwrap_or(defaults.media_root),
            page_size: parse_or("ENGINE_PAGE_SIZE", get("ENGINE_PAGE_SIZE"), defaults.page_size)?,
            max_page_size: parse_or("ENGINE_MAX_PAGE_SIZE", get("ENGINE_MAX_PAGE_SIZE"), defaults.max_page_size)?,
            max_upload_bytes: parse_or(
                "ENGINE_MAX_UPLOAD_BYTES",
                get("ENGINE_MAX_UPLOAD_BYTES"),
                defaults.max_upload_bytes,
            )?,
            reject_unknown_operators: parse_or(
                "ENGINE_REJECT_UNKNOWN_OPERATORS",
                get("ENGINE_REJECT_UNKNOWN_OPERATORS"),
                defaults.reject_unknown_operators,
            )?,
        })
    }

    pub fn operator_policy(&self) -> OperatorPolicy {
        if self.reject_unknown_operators {
            OperatorPolicy::Reject
        } else {
            OperatorPolicy::Skip
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::Validation(format!("{} has an invalid value: {}", key, v))),
    }
}
