//! Farmgate settlement core
//!
//! Orders, inventory, fees, payments, shipments, cancellations and refunds
//! for a farm-produce marketplace.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod integrations;
pub mod metrics;
pub mod migrator;
pub mod services;

pub use errors::ServiceError;
pub use handlers::{router, AppState};
pub use services::SettlementServices;
