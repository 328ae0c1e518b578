//! Latest price per instrument.
//!
//! One `watch` cell per configured instrument, created up front and never
//! removed. `watch` gives latest-value semantics: a reader always sees a whole
//! `(price, observed_at)` pair, and each cell has exactly one writer (its feed
//! connector), so there is no cross-instrument contention.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;

use crate::types::{Instruments, PriceQuote};

pub struct PriceTable {
    cells: HashMap<&'static str, watch::Sender<PriceQuote>>,
}

impl PriceTable {
    #[must_use]
    pub fn new(instruments: &Instruments) -> Self {
        let cells = instruments
            .iter()
            .map(|i| (i.code, watch::Sender::new(PriceQuote::default())))
            .collect();
        Self { cells }
    }

    /// Current quote, or `None` if `code` is not a configured instrument.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<PriceQuote> {
        self.cells.get(code).map(|cell| *cell.borrow())
    }

    /// Overwrite the quote for `code`. Returns `false` for unknown codes.
    pub fn set(&self, code: &str, price: Decimal, observed_at: DateTime<Utc>) -> bool {
        let Some(cell) = self.cells.get(code) else {
            return false;
        };
        cell.send_replace(PriceQuote {
            price: Some(price),
            observed_at: Some(observed_at),
        });
        true
    }

    /// Latest-value receiver for `code`.
    #[must_use]
    pub fn subscribe(&self, code: &str) -> Option<watch::Receiver<PriceQuote>> {
        self.cells.get(code).map(watch::Sender::subscribe)
    }

    /// Wait up to `timeout` for the first price of `code` to arrive.
    pub async fn wait_for_price(&self, code: &str, timeout: Duration) -> Option<Decimal> {
        let mut rx = self.subscribe(code)?;
        let first = tokio::time::timeout(timeout, rx.wait_for(|q| q.price.is_some())).await;
        match first {
            Ok(Ok(quote)) => quote.price,
            _ => None,
        }
    }

    /// Number of instruments that have received at least one tick.
    #[must_use]
    pub fn priced_count(&self) -> usize {
        self.cells
            .values()
            .filter(|cell| cell.borrow().price.is_some())
            .count()
    }
}
