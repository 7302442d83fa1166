use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

use crate::error::ServerError;

pub const DEFAULT_SECRETS_DIR: &str = "/run/secrets";

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub secret_name: String,
    pub secret_vault: String,
    pub counter_key: String,
    pub records_collection: String,
}

impl Config {
    pub fn load() -> Result<Self, ServerError> {
        Ok(Self {
            port: try_load("RUST_PORT", "8080")?,
            secret_name: try_load("SECRET_NAME", "StoreConnectionString")?,
            secret_vault: try_load("SECRET_VAULT", DEFAULT_SECRETS_DIR)?,
            counter_key: try_load("COUNTER_KEY", "visits")?,
            records_collection: try_load("RECORDS_COLLECTION", "records")?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            secret_name: "StoreConnectionString".to_string(),
            secret_vault: DEFAULT_SECRETS_DIR.to_string(),
            counter_key: "visits".to_string(),
            records_collection: "records".to_string(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> Result<T, ServerError>
where
    T::Err: Display,
{
    parse(key, var(key), default)
}

fn parse<T: FromStr>(key: &str, value: Option<String>, default: &str) -> Result<T, ServerError>
where
    T::Err: Display,
{
    value
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .trim()
        .parse()
        .map_err(|e| {
            warn!("Invalid {key} value: {e}");
            ServerError::Config(format!("{key}: {e}"))
        })
}
