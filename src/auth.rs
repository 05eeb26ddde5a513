// ============================================================
// src/auth.rs — bearer-token validation and identity resolution
// ============================================================
// The ledger never authenticates anyone. This layer turns a request
// into an Identity (user id + roles) or rejects it, so that by the
// time a handler touches the ledger the caller is already resolved.
//
// The storefront forwards the acting user in the X-User-ID header
// alongside its own service token; roles live in the token claims,
// in one of several places depending on how the auth server was
// configured (direct claim, realm roles, or per-client roles).

use std::collections::HashMap;

use actix_web::HttpRequest;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::config::Config;
use crate::ledger::AccountId;

const DEFAULT_ROLE: &str = "USER";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing Authorization header")]
    MissingToken,
    #[error("malformed Authorization header")]
    MalformedHeader,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("missing or invalid X-User-ID header")]
    MissingUserId,
}

/// The resolved caller: stable account identifier plus granted roles.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: AccountId,
    pub roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    realm_access: Option<RoleSet>,
    #[serde(default)]
    resource_access: Option<HashMap<String, RoleSet>>,
}

#[derive(Debug, Deserialize)]
struct RoleSet {
    #[serde(default)]
    roles: Vec<String>,
}

/// Validate the bearer token and resolve the acting user.
///
/// Both failures are reported upstream as 401; the ledger is never
/// reached with an unresolved identity.
pub fn authenticate(req: &HttpRequest, config: &Config) -> Result<Identity, AuthError> {
    let claims = validate_token(req, config)?;
    let user_id = user_id_header(req)?;
    let roles = extract_roles(&claims, &config.oauth_client_name);
    debug!(
        "[payment] authenticated subject {:?} acting for user {user_id} with roles {roles:?}",
        claims.sub
    );
    Ok(Identity { user_id, roles })
}

fn validate_token(req: &HttpRequest, config: &Config) -> Result<Claims, AuthError> {
    let auth = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let token = auth
        .strip_prefix("Bearer ")
        .ok_or(AuthError::MalformedHeader)?;

    let mut validation = Validation::new(Algorithm::HS256);
    // Tokens are minted for several services; audience is not checked here.
    validation.validate_aud = false;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &validation,
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    Ok(data.claims)
}

// Absent, blank, or non-numeric user ids are all the same failure:
// the storefront did not resolve an acting user for this call.
fn user_id_header(req: &HttpRequest) -> Result<AccountId, AuthError> {
    req.headers()
        .get("X-User-ID")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<AccountId>().ok())
        .ok_or(AuthError::MissingUserId)
}

/// Search the known claim locations for roles, in priority order:
/// a direct `roles` claim, then `realm_access.roles`, then
/// `resource_access.<client>.roles`. Falls back to a single USER
/// role when the token carries none.
fn extract_roles(claims: &Claims, client_name: &str) -> Vec<String> {
    let mut roles = Vec::new();

    if let Some(direct) = &claims.roles {
        roles.extend(direct.iter().cloned());
    }
    if let Some(realm) = &claims.realm_access {
        roles.extend(realm.roles.iter().cloned());
    }
    if let Some(resources) = &claims.resource_access {
        if let Some(client) = resources.get(client_name) {
            roles.extend(client.roles.iter().cloned());
        }
    }

    if roles.is_empty() {
        roles.push(DEFAULT_ROLE.to_string());
    }
    roles
}
