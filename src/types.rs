//! Core domain types: instruments, quotes, subscribers.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A tradable asset with a configured feed endpoint. Instruments live in the
/// static [`CATALOG`] and are referenced as `&'static Instrument`.
#[derive(Debug, PartialEq, Eq)]
pub struct Instrument {
    /// Unique key, e.g. `"BTC"`.
    pub code: &'static str,
    pub name: &'static str,
    pub symbol: &'static str,
    /// Venue pair used to build the stream endpoint, e.g. `"btceur"`.
    pub pair: &'static str,
    /// Quote currency shown next to the price.
    pub quote: &'static str,
}

/// Every instrument the relay knows how to stream.
pub static CATALOG: [Instrument; 4] = [
    Instrument { code: "BTC", name: "Bitcoin", symbol: "₿", pair: "btceur", quote: "EUR" },
    Instrument { code: "ETH", name: "Ethereum", symbol: "Ξ", pair: "etheur", quote: "EUR" },
    Instrument { code: "SOL", name: "Solana", symbol: "◎", pair: "soleur", quote: "EUR" },
    Instrument { code: "XRP", name: "XRP", symbol: "✕", pair: "xrpeur", quote: "EUR" },
];

/// Look up a catalog entry by code (case-insensitive).
#[must_use]
pub fn catalog_entry(code: &str) -> Option<&'static Instrument> {
    CATALOG.iter().find(|i| i.code.eq_ignore_ascii_case(code))
}

/// The configured instrument set plus the default new subscribers start on.
#[derive(Debug, Clone)]
pub struct Instruments {
    entries: Vec<&'static Instrument>,
    default: &'static Instrument,
}

impl Instruments {
    /// Build the set from catalog codes. Fails on unknown or duplicate codes
    /// and when `default` is not part of the set.
    pub fn new<S: AsRef<str>>(codes: &[S], default: &str) -> Result<Self> {
        let mut entries: Vec<&'static Instrument> = Vec::with_capacity(codes.len());
        for code in codes {
            let code = code.as_ref().trim();
            let entry = catalog_entry(code)
                .ok_or_else(|| Error::Config(format!("unknown instrument code {code:?}")))?;
            if entries.iter().any(|e| e.code == entry.code) {
                return Err(Error::Config(format!("instrument {} listed twice", entry.code)));
            }
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(Error::Config("no instruments configured".into()));
        }
        let default = entries
            .iter()
            .copied()
            .find(|e| e.code.eq_ignore_ascii_case(default))
            .ok_or_else(|| {
                Error::Config(format!("default instrument {default:?} is not configured"))
            })?;
        Ok(Self { entries, default })
    }

    /// Resolve a code against the configured set.
    #[must_use]
    pub fn get(&self, code: &str) -> Option<&'static Instrument> {
        self.entries
            .iter()
            .copied()
            .find(|e| e.code.eq_ignore_ascii_case(code))
    }

    #[must_use]
    pub fn default_instrument(&self) -> &'static Instrument {
        self.default
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Instrument> + '_ {
        self.entries.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Latest known price for one instrument. `price` is `None` until the first
/// tick arrives and must never be read as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceQuote {
    pub price: Option<Decimal>,
    pub observed_at: Option<DateTime<Utc>>,
}

/// Recipient identity (a chat id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub i64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to the last notification sent to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub i64);

impl fmt::Display for NotificationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Holdings keyed by instrument code. Opaque to the relay; persisted as-is.
pub type Portfolio = BTreeMap<String, f64>;

/// Per-subscriber preferences and delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub instrument: &'static Instrument,
    pub active: bool,
    /// Price last rendered to this subscriber by a successful delivery.
    pub last_delivered_price: Option<Decimal>,
    /// `None` means the next delivery must create rather than edit.
    pub notification_handle: Option<NotificationHandle>,
    pub portfolio: Portfolio,
    /// Bumped whenever the delivery bookkeeping is reset. Delivery results
    /// only commit against the generation they were planned with.
    pub(crate) generation: u64,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, instrument: &'static Instrument) -> Self {
        Self {
            id,
            instrument,
            active: false,
            last_delivered_price: None,
            notification_handle: None,
            portfolio: Portfolio::new(),
            generation: 0,
        }
    }

    pub(crate) fn reset_delivery(&mut self) {
        self.last_delivered_price = None;
        self.notification_handle = None;
        self.generation += 1;
    }
}
