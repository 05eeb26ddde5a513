// ============================================================
// src/client.rs — storefront-side ledger client
// ============================================================
// Runs inside the calling service. Fetches a service token via the
// client-credentials grant, attaches it plus the acting user's id to
// every request, and maps the ledger's responses back onto the same
// error taxonomy the service uses. Business rejections are passed
// through untouched; only transport and authentication failures are
// retried, exactly once, after a short backoff.

use std::time::{Duration, Instant};

use log::warn;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::handlers::{BalanceResponse, ErrorResponse, PaymentRequest};
use crate::ledger::AccountId;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
// Refresh slightly early so a token never expires mid-flight.
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response ({status}): {message}")]
    Unexpected { status: u16, message: String },
}

impl ClientError {
    // Business-rule failures must never be retried; a second attempt
    // would just debit twice or fail identically.
    fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::Unauthenticated(_)
        )
    }
}

// ── Token Acquisition ─────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    // Expiry is clipped by the margin up front, so a short-lived token
    // is simply never considered fresh.
    fn new(access_token: String, expires_in: Duration, now: Instant) -> Self {
        Self {
            access_token,
            expires_at: now + expires_in.saturating_sub(EXPIRY_MARGIN),
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Client-credentials token source with in-process caching. One token
/// is shared across requests until shortly before it expires.
pub struct TokenSource {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url,
            client_id,
            client_secret,
            cached: Mutex::new(None),
        }
    }

    pub async fn access_token(&self) -> Result<String, ClientError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthenticated(
                "token endpoint rejected client credentials".to_string(),
            ));
        }
        if !response.status().is_success() {
            return Err(ClientError::Unexpected {
                status: response.status().as_u16(),
                message: "token endpoint failure".to_string(),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken::new(
            token.access_token,
            Duration::from_secs(token.expires_in),
            Instant::now(),
        ));
        Ok(access_token)
    }

    // Drop the cached token so the retry path re-authenticates.
    async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

// ── Ledger Client ─────────────────────────────────────────────

pub struct PaymentClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenSource,
}

impl PaymentClient {
    pub fn new(base_url: String, tokens: TokenSource) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            tokens,
        }
    }

    /// Current balance of the acting user.
    pub async fn get_balance(&self, user_id: AccountId) -> Result<Decimal, ClientError> {
        self.with_retry(|| self.get_balance_once(user_id)).await
    }

    /// Debit `amount` from the acting user; returns the new balance.
    pub async fn pay(&self, user_id: AccountId, amount: Decimal) -> Result<Decimal, ClientError> {
        self.with_retry(|| self.pay_once(user_id, amount)).await
    }

    async fn with_retry<F, Fut>(&self, call: F) -> Result<Decimal, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Decimal, ClientError>>,
    {
        match call().await {
            Err(e) if e.is_transient() => {
                warn!("[payment-client] retrying after transient failure: {e}");
                self.tokens.invalidate().await;
                tokio::time::sleep(RETRY_BACKOFF).await;
                call().await
            }
            other => other,
        }
    }

    async fn get_balance_once(&self, user_id: AccountId) -> Result<Decimal, ClientError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(format!("{}/api/balance", self.base_url))
            .bearer_auth(token)
            .header("X-User-ID", user_id.to_string())
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        read_balance(response).await
    }

    async fn pay_once(&self, user_id: AccountId, amount: Decimal) -> Result<Decimal, ClientError> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(format!("{}/api/payment", self.base_url))
            .bearer_auth(token)
            .header("X-User-ID", user_id.to_string())
            .json(&PaymentRequest { amount })
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        read_balance(response).await
    }
}

async fn read_balance(response: reqwest::Response) -> Result<Decimal, ClientError> {
    let status = response.status();
    if status.is_success() {
        let body: BalanceResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        return Ok(body.balance);
    }
    let body: ErrorResponse = response.json().await.unwrap_or_default();
    Err(classify_failure(status, body))
}

fn classify_failure(status: StatusCode, body: ErrorResponse) -> ClientError {
    match status {
        StatusCode::UNAUTHORIZED => ClientError::Unauthenticated(body.error),
        StatusCode::BAD_REQUEST => match body.code.as_deref() {
            Some("invalid_amount") => ClientError::InvalidAmount(body.error),
            Some("insufficient_funds") => ClientError::InsufficientFunds(body.error),
            _ => ClientError::Unexpected {
                status: status.as_u16(),
                message: body.error,
            },
        },
        _ => ClientError::Unexpected {
            status: status.as_u16(),
            message: body.error,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(error: &str, code: Option<&str>) -> ErrorResponse {
        ErrorResponse {
            error: error.to_string(),
            code: code.map(str::to_string),
        }
    }

    #[test]
    fn unauthorized_maps_to_unauthenticated() {
        let err = classify_failure(StatusCode::UNAUTHORIZED, body("missing token", None));
        assert!(matches!(err, ClientError::Unauthenticated(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn business_rejections_map_by_code_and_are_not_retried() {
        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            body("insufficient balance", Some("insufficient_funds")),
        );
        assert!(matches!(err, ClientError::InsufficientFunds(_)));
        assert!(!err.is_transient());

        let err = classify_failure(
            StatusCode::BAD_REQUEST,
            body("amount must be positive", Some("invalid_amount")),
        );
        assert!(matches!(err, ClientError::InvalidAmount(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn unknown_statuses_map_to_unexpected() {
        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, body("boom", None));
        assert!(matches!(
            err,
            ClientError::Unexpected { status: 500, .. }
        ));
    }

    #[test]
    fn transport_failures_are_transient() {
        assert!(ClientError::Transport("connection refused".to_string()).is_transient());
    }

    #[test]
    fn cached_token_is_reused_until_the_expiry_margin() {
        let now = Instant::now();
        let token = CachedToken::new("tok".to_string(), Duration::from_secs(300), now);

        // Fresh right up to expires_in minus the 30s margin, stale after.
        assert!(token.is_fresh(now));
        assert!(token.is_fresh(now + Duration::from_secs(269)));
        assert!(!token.is_fresh(now + Duration::from_secs(270)));
    }

    #[test]
    fn short_lived_tokens_are_never_considered_fresh() {
        let now = Instant::now();
        let token = CachedToken::new("tok".to_string(), Duration::from_secs(10), now);
        assert!(!token.is_fresh(now));
    }

    #[tokio::test]
    async fn invalidate_drops_the_cached_token() {
        let source = TokenSource::new(
            "http://localhost/token".to_string(),
            "storefront".to_string(),
            "secret".to_string(),
        );
        *source.cached.lock().await = Some(CachedToken::new(
            "tok".to_string(),
            Duration::from_secs(300),
            Instant::now(),
        ));

        source.invalidate().await;
        assert!(source.cached.lock().await.is_none());
    }
}
