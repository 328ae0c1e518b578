//! Notification sinks.
//!
//! The broadcaster only needs two primitives from a transport: create a new
//! notification for a recipient, and edit an existing one in place. Edits
//! distinguish three failure modes because the broadcaster recovers from each
//! differently.

pub mod log;
pub mod telegram;

use thiserror::Error;

use crate::types::{Instrument, NotificationHandle, PriceQuote, SubscriberId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("create failed: {0}")]
pub struct CreateError(pub String);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EditError {
    /// The notification being edited no longer exists.
    #[error("notification not found")]
    NotFound,
    /// The new content is identical to what is already shown.
    #[error("notification content unchanged")]
    Unchanged,
    #[error("edit failed: {0}")]
    Other(String),
}

/// Trait implemented by each notification transport.
pub trait NotificationSink: Send + Sync + 'static {
    fn create(
        &self,
        recipient: SubscriberId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<NotificationHandle, CreateError>> + Send;

    fn edit(
        &self,
        recipient: SubscriberId,
        handle: NotificationHandle,
        text: &str,
    ) -> impl std::future::Future<Output = Result<(), EditError>> + Send;
}

/// Render a quote for delivery. Returns `None` while no price is known.
#[must_use]
pub fn render(instrument: &Instrument, quote: &PriceQuote) -> Option<String> {
    let price = quote.price?;
    let mut text = format!(
        "{} {}/{}: {:.2}",
        instrument.symbol, instrument.code, instrument.quote, price
    );
    if let Some(at) = quote.observed_at {
        text.push_str("\nUpdated: ");
        text.push_str(&at.format("%H:%M:%S UTC").to_string());
    }
    Some(text)
}
