// ============================================================
// src/config.rs — environment-driven configuration
// ============================================================
// Secrets (JWT signing key) come from Vault Agent injection in the
// cluster; everything else has a sensible development default.

use std::env;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: String,
    /// HS256 key used to validate bearer tokens.
    pub jwt_secret: String,
    /// Balance every newly-seen user starts with.
    pub opening_balance: Decimal,
    /// OAuth2 client whose `resource_access` entry may carry roles.
    pub oauth_client_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let opening_raw = env::var("OPENING_BALANCE").unwrap_or_else(|_| "10000".to_string());
        Ok(Self {
            port: env::var("PORT").unwrap_or_else(|_| "8090".to_string()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            opening_balance: parse_opening_balance(&opening_raw)?,
            oauth_client_name: env::var("OAUTH_CLIENT_NAME")
                .unwrap_or_else(|_| "payment-service".to_string()),
        })
    }
}

// Rejects garbage and negative values but not precision; the ledger
// constructor enforces whole-cent representability itself.
fn parse_opening_balance(raw: &str) -> Result<Decimal, ConfigError> {
    raw.trim()
        .parse::<Decimal>()
        .ok()
        .filter(|d| !d.is_sign_negative())
        .ok_or(ConfigError::Invalid {
            name: "OPENING_BALANCE",
            value: raw.to_string(),
        })
}
