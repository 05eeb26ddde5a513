// ============================================================
// src/handlers.rs — HTTP surface
// ============================================================
// Identity travels only in headers (bearer token + X-User-ID), never
// in the body, so a caller cannot ask the ledger to operate on a user
// the auth layer did not resolve.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use log::info;
use prometheus::{Counter, Encoder, Registry, TextEncoder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::config::Config;
use crate::ledger::{Ledger, LedgerError};

// ── Wire Types ────────────────────────────────────────────────
// Decimals are serialized as strings ("9900.00") to keep amounts
// exact on the wire; the storefront client parses them back.

#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    pub balance: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount: Decimal,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ── Route Registration ────────────────────────────────────────
// Shared between main() and the endpoint tests.

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Platform routes
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        // Business routes
        .route("/api/balance", web::get().to(get_balance))
        .route("/api/payment", web::post().to(process_payment));
}

// ── Handlers ──────────────────────────────────────────────────

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "ok",
        "service": "payment-service",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler(registry: web::Data<Registry>) -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    let metric_families = registry.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().json(ErrorResponse {
            error: e.to_string(),
            code: None,
        });
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}

async fn get_balance(
    req: HttpRequest,
    ledger: web::Data<Ledger>,
    config: web::Data<Config>,
) -> HttpResponse {
    let identity = match auth::authenticate(&req, &config) {
        Ok(identity) => identity,
        Err(e) => return unauthorized(e),
    };

    HttpResponse::Ok().json(BalanceResponse {
        balance: ledger.balance(identity.user_id),
    })
}

async fn process_payment(
    req: HttpRequest,
    payload: web::Json<PaymentRequest>,
    ledger: web::Data<Ledger>,
    config: web::Data<Config>,
    counter: web::Data<Counter>,
) -> HttpResponse {
    let identity = match auth::authenticate(&req, &config) {
        Ok(identity) => identity,
        Err(e) => return unauthorized(e),
    };

    match ledger.debit(identity.user_id, payload.amount) {
        Ok(balance) => {
            counter.inc();
            info!(
                "[payment] Debited {} from user {} (roles {:?}), new balance {}",
                payload.amount, identity.user_id, identity.roles, balance
            );
            HttpResponse::Ok().json(BalanceResponse { balance })
        }
        Err(e) => rejected(e),
    }
}

fn unauthorized(e: auth::AuthError) -> HttpResponse {
    HttpResponse::Unauthorized().json(ErrorResponse {
        error: e.to_string(),
        code: None,
    })
}

// Business rejections are 400s carrying a stable machine-readable
// code; the balance is untouched in both cases.
fn rejected(e: LedgerError) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: e.to_string(),
        code: Some(e.code().to_string()),
    })
}
