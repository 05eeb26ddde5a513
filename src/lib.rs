// ============================================================
// payment-service — balance ledger microservice
// ============================================================
// Holds per-user balances in memory and applies debits atomically.
// The storefront calls it over HTTP with a service bearer token and
// the acting user forwarded in the X-User-ID header; the client for
// that storefront side lives in `client`.

pub mod auth;
pub mod client;
pub mod config;
pub mod handlers;
pub mod ledger;
