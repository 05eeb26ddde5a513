// ============================================================
// src/main.rs — payment-service (Rust + Actix-web)
// ============================================================
// WHY Rust for payment-service?
//   - Memory safety WITHOUT a garbage collector — no surprise GC pauses
//     when processing payments (critical path latency matters)
//   - The type system makes many entire classes of bugs (null deref,
//     data races, use-after-free) impossible at compile time
//   - Actix-web is among the fastest HTTP frameworks across all languages
//
// This service is the system of record for user balances: an in-memory
// ledger seeded with a configured opening balance, debited atomically
// by the storefront's checkout flow. Secrets (the JWT key) come from
// Vault Agent injection.

use actix_web::{middleware, web, App, HttpServer};
use log::info;
use prometheus::{Counter, Opts, Registry};

use payment_service::config::Config;
use payment_service::handlers;
use payment_service::ledger::Ledger;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let config = Config::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let addr = format!("0.0.0.0:{}", config.port);

    // Prometheus registry
    let registry = Registry::new();
    let payment_counter = Counter::with_opts(Opts::new(
        "payment_service_payments_total",
        "Total payments processed",
    ))
    .expect("payment counter opts are valid");
    registry
        .register(Box::new(payment_counter.clone()))
        .expect("payment counter registers once");

    // Shared in-memory ledger
    let ledger = web::Data::new(
        Ledger::new(config.opening_balance)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?,
    );
    let config = web::Data::new(config);

    info!(
        "[payment-service] Listening on {addr}, opening balance {}",
        config.opening_balance
    );

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(ledger.clone())
            .app_data(config.clone())
            .app_data(web::Data::new(registry.clone()))
            .app_data(web::Data::new(payment_counter.clone()))
            .configure(handlers::configure)
    })
    .bind(&addr)?
    .run()
    .await
}
