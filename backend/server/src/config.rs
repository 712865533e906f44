use std::{env, fmt::Display, fs::read_to_string, str::FromStr};

use thiserror::Error;
use tracing::{info, warn};

const SECRETS_DIR: &str = "/run/secrets";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {reason}")]
    Invalid { key: String, reason: String },

    #[error("Secret {0} not found in /run/secrets or the environment")]
    MissingSecret(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Postgres,
    Memory,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" => Ok(StoreKind::Postgres),
            "memory" => Ok(StoreKind::Memory),
            other => Err(format!("expected postgres or memory, got {other}")),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub stripe_secret_key: String,
    pub stripe_webhook_secret: String,
    pub stripe_api_base: String,
    pub currency: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_sources(|key| env::var(key).ok(), read_secret)
    }

    /// `var` looks up plain settings, `secret` looks up credentials.
    pub fn from_sources<V, S>(var: V, secret: S) -> Result<Self, ConfigError>
    where
        V: Fn(&str) -> Option<String>,
        S: Fn(&str) -> Option<String>,
    {
        let store: StoreKind = try_load(&var, "STORE", "postgres")?;

        let database_url = match store {
            StoreKind::Postgres => Some(require(&secret, "DATABASE_URL")?),
            StoreKind::Memory => None,
        };

        Ok(Self {
            port: try_load(&var, "RUST_PORT", "8888")?,
            store,
            database_url,
            database_max_connections: try_load(&var, "DATABASE_MAX_CONNECTIONS", "5")?,
            stripe_secret_key: require(&secret, "STRIPE_SECRET_KEY")?,
            stripe_webhook_secret: require(&secret, "STRIPE_WEBHOOK_SECRET")?,
            stripe_api_base: try_load(&var, "STRIPE_API_BASE", "https://api.stripe.com")?,
            currency: try_load::<String, _>(&var, "CURRENCY", "usd")?.to_lowercase(),
        })
    }
}

fn try_load<T, V>(var: &V, key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    V: Fn(&str) -> Option<String>,
{
    var(key)
        .unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");

            ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
}

fn require<S>(secret: &S, name: &str) -> Result<String, ConfigError>
where
    S: Fn(&str) -> Option<String>,
{
    secret(name).ok_or_else(|| ConfigError::MissingSecret(name.to_string()))
}

/// Docker secret first, environment second.
fn read_secret(secret_name: &str) -> Option<String> {
    let path = format!("{SECRETS_DIR}/{secret_name}");

    match read_to_string(&path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            info!("Failed to read {secret_name} from file: {e}, trying environment");

            env::var(secret_name).ok().filter(|s| !s.is_empty())
        }
    }
}
