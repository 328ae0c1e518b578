//! Price relay library.
//!
//! Streams live ticker prices for a fixed set of instruments from exchange
//! websockets into a shared price table, and relays them to subscribers as a
//! single self-updating notification each, deduplicated and rate-limited.

pub mod broadcaster;
pub mod config;
pub mod delivery;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod persistence;
pub mod price_table;
pub mod registry;
pub mod relay;
pub mod signal;
pub mod sink;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;
