//! Resilient retrieval and aggregation layer for a Telegram user-account relay.
//!
//! This crate is framework-agnostic. The platform client lives behind the
//! [`ports::ChatApi`] trait; everything here wraps it with retry/backoff,
//! bounded TTL caches, media-group reassembly, per-pair filtering and
//! error classification.

pub mod cache;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fetcher;
pub mod filter;
pub mod layer;
pub mod logging;
pub mod media_group;
pub mod ports;
pub mod resolver;
pub mod retry;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
