//! Subscriber registry.
//!
//! A sharded `DashMap` keyed by subscriber id: mutations of one id hold that
//! entry's shard lock, different ids proceed concurrently, and every read that
//! the broadcaster iterates over is a cloned snapshot so mutations never show
//! up mid-pass. No lock is ever held across an `.await`.

use std::collections::BTreeMap;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::types::{Instrument, Instruments, NotificationHandle, Portfolio, Subscriber, SubscriberId};

/// Result of [`Registry::set_active`]. Idempotent calls are distinguishable
/// so the command layer can tell the user "already on".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveChange {
    Activated,
    AlreadyActive,
    Deactivated,
    AlreadyInactive,
}

/// A persisted subscriber as loaded from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredSubscriber {
    pub id: SubscriberId,
    pub active: bool,
    pub instrument: &'static Instrument,
    pub portfolio: Portfolio,
}

pub struct Registry {
    subscribers: DashMap<SubscriberId, Subscriber>,
    instruments: Instruments,
}

impl Registry {
    #[must_use]
    pub fn new(instruments: Instruments) -> Self {
        Self {
            subscribers: DashMap::new(),
            instruments,
        }
    }

    #[must_use]
    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    fn fresh(&self, id: SubscriberId) -> Subscriber {
        Subscriber::new(id, self.instruments.default_instrument())
    }

    /// Existing record, or a new inactive one on the default instrument.
    pub fn get_or_create(&self, id: SubscriberId) -> Subscriber {
        self.subscribers
            .entry(id)
            .or_insert_with(|| self.fresh(id))
            .value()
            .clone()
    }

    /// Switch instrument. Always resets delivery bookkeeping, even when the
    /// instrument is unchanged.
    pub fn set_instrument(&self, id: SubscriberId, code: &str) -> Result<Subscriber> {
        let instrument = self
            .instruments
            .get(code)
            .ok_or_else(|| Error::UnsupportedInstrument(code.to_string()))?;
        let mut entry = self.subscribers.entry(id).or_insert_with(|| self.fresh(id));
        entry.instrument = instrument;
        entry.reset_delivery();
        debug!(subscriber = %id, instrument = instrument.code, "instrument selected");
        Ok(entry.value().clone())
    }

    pub fn set_active(&self, id: SubscriberId, active: bool) -> ActiveChange {
        let mut entry = self.subscribers.entry(id).or_insert_with(|| self.fresh(id));
        match (entry.active, active) {
            (true, true) => ActiveChange::AlreadyActive,
            (false, false) => ActiveChange::AlreadyInactive,
            (false, true) => {
                entry.active = true;
                entry.reset_delivery();
                info!(subscriber = %id, instrument = entry.instrument.code, "updates enabled");
                ActiveChange::Activated
            }
            (true, false) => {
                entry.active = false;
                info!(subscriber = %id, "updates disabled");
                ActiveChange::Deactivated
            }
        }
    }

    /// Snapshot of the active subscribers on `code`.
    #[must_use]
    pub fn list_active_for(&self, code: &str) -> Vec<Subscriber> {
        self.subscribers
            .iter()
            .filter(|s| s.active && s.instrument.code == code)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Snapshot of all active subscribers grouped by instrument code. Only
    /// instruments with at least one active subscriber appear.
    #[must_use]
    pub fn active_by_instrument(&self) -> BTreeMap<&'static str, Vec<Subscriber>> {
        let mut groups: BTreeMap<&'static str, Vec<Subscriber>> = BTreeMap::new();
        for s in self.subscribers.iter().filter(|s| s.active) {
            groups.entry(s.instrument.code).or_default().push(s.value().clone());
        }
        groups
    }

    /// Commit a successful delivery. Ignored (returns `false`) when the
    /// subscriber's bookkeeping was reset after the delivery was planned.
    pub fn record_delivery(
        &self,
        id: SubscriberId,
        generation: u64,
        handle: NotificationHandle,
        price: Decimal,
    ) -> bool {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return false;
        };
        if entry.generation != generation {
            debug!(subscriber = %id, "stale delivery discarded");
            return false;
        }
        entry.notification_handle = Some(handle);
        entry.last_delivered_price = Some(price);
        true
    }

    /// Drop a handle the sink reported as gone, so the next pass creates
    /// instead of editing it again. Same generation guard as
    /// [`Registry::record_delivery`]; a handle replaced meanwhile is kept.
    pub fn forget_handle(&self, id: SubscriberId, generation: u64, handle: NotificationHandle) -> bool {
        let Some(mut entry) = self.subscribers.get_mut(&id) else {
            return false;
        };
        if entry.generation != generation || entry.notification_handle != Some(handle) {
            return false;
        }
        entry.notification_handle = None;
        entry.last_delivered_price = None;
        true
    }

    /// Mutate a subscriber's holdings in place.
    pub fn update_portfolio<R>(&self, id: SubscriberId, f: impl FnOnce(&mut Portfolio) -> R) -> R {
        let mut entry = self.subscribers.entry(id).or_insert_with(|| self.fresh(id));
        f(&mut entry.portfolio)
    }

    /// Snapshot of every subscriber, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Subscriber> {
        let mut all: Vec<Subscriber> = self.subscribers.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Load persisted subscribers. Delivery bookkeeping always starts empty:
    /// handles from a previous process are not trusted.
    pub fn hydrate(&self, restored: impl IntoIterator<Item = RestoredSubscriber>) {
        for r in restored {
            let mut sub = Subscriber::new(r.id, r.instrument);
            sub.active = r.active;
            sub.portfolio = r.portfolio;
            self.subscribers.insert(r.id, sub);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.subscribers.iter().filter(|s| s.active).count()
    }
}
