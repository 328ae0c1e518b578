//! Entry points for a chat command layer.
//!
//! [`Relay`] ties the registry, price table and store together so every
//! state-changing command is followed by a save. Save failures are logged and
//! counted, never surfaced to the caller.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;

use tracing::warn;

use crate::error::Result;
use crate::metrics::Metrics;
use crate::persistence::SubscriberStore;
use crate::price_table::PriceTable;
use crate::registry::{ActiveChange, Registry};
use crate::signal::SignalSender;
use crate::types::{Portfolio, PriceQuote, Subscriber, SubscriberId};

#[derive(Clone)]
pub struct Relay {
    prices: Arc<PriceTable>,
    registry: Arc<Registry>,
    store: Arc<SubscriberStore>,
    signal: SignalSender,
    metrics: Arc<Metrics>,
}

impl Relay {
    #[must_use]
    pub fn new(
        prices: Arc<PriceTable>,
        registry: Arc<Registry>,
        store: Arc<SubscriberStore>,
        signal: SignalSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            prices,
            registry,
            store,
            signal,
            metrics,
        }
    }

    #[must_use]
    pub fn subscriber(&self, id: SubscriberId) -> Subscriber {
        self.registry.get_or_create(id)
    }

    /// Switch the subscriber's instrument. Unknown codes leave everything
    /// untouched and are returned as [`crate::error::Error::UnsupportedInstrument`].
    pub async fn select_instrument(&self, id: SubscriberId, code: &str) -> Result<Subscriber> {
        let sub = self.registry.set_instrument(id, code)?;
        self.persist().await;
        if sub.active {
            self.signal.notify();
        }
        Ok(sub)
    }

    /// Turn updates on. A fresh activation wakes the broadcaster so the first
    /// notification goes out on the next permitted pass.
    pub async fn start_updates(&self, id: SubscriberId) -> ActiveChange {
        let change = self.registry.set_active(id, true);
        if change == ActiveChange::Activated {
            self.persist().await;
            self.signal.notify();
        }
        change
    }

    pub async fn stop_updates(&self, id: SubscriberId) -> ActiveChange {
        let change = self.registry.set_active(id, false);
        if change == ActiveChange::Deactivated {
            self.persist().await;
        }
        change
    }

    #[must_use]
    pub fn quote(&self, code: &str) -> Option<PriceQuote> {
        self.prices.get(code)
    }

    pub async fn update_portfolio<R>(&self, id: SubscriberId, f: impl FnOnce(&mut Portfolio) -> R) -> R {
        let out = self.registry.update_portfolio(id, f);
        self.persist().await;
        out
    }

    /// Save the whole registry. Returns whether the save succeeded.
    pub async fn persist(&self) -> bool {
        match self.store.save(&self.registry).await {
            Ok(_) => {
                self.metrics.saves.fetch_add(1, Relaxed);
                true
            }
            Err(e) => {
                self.metrics.save_errors.fetch_add(1, Relaxed);
                warn!(path = %self.store.path().display(), error = %e, "failed to save state");
                false
            }
        }
    }
}
