//! Shared test fixtures and helpers.
//!
//! Reusable constructors for domain types and a recording notification sink,
//! so the broadcaster, registry and relay tests don't each roll their own.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering::Relaxed};

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::sink::{CreateError, EditError, NotificationSink};
use crate::types::{Instruments, NotificationHandle, PriceQuote, SubscriberId};

/// The full catalog with BTC as default.
pub(crate) fn instruments() -> Instruments {
    Instruments::new(&["BTC", "ETH", "SOL", "XRP"], "BTC").unwrap()
}

/// Exact decimal from a literal.
pub(crate) fn price(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

/// Deterministic timestamp `secs` seconds into the test epoch.
pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub(crate) fn quote(p: &str, secs: i64) -> PriceQuote {
    PriceQuote {
        price: Some(price(p)),
        observed_at: Some(at(secs)),
    }
}

/// One call observed by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Create(SubscriberId),
    Edit(SubscriberId, NotificationHandle),
}

/// Sink that records every call. Edit outcomes can be scripted; unscripted
/// edits succeed.
#[derive(Default)]
pub(crate) struct RecordingSink {
    calls: Mutex<Vec<Call>>,
    texts: Mutex<Vec<String>>,
    edit_script: Mutex<VecDeque<Result<(), EditError>>>,
    fail_creates: Mutex<bool>,
    next_handle: AtomicI64,
}

impl RecordingSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_edit(&self, outcome: Result<(), EditError>) {
        self.edit_script.lock().unwrap().push_back(outcome);
    }

    pub(crate) fn fail_creates(&self, fail: bool) {
        *self.fail_creates.lock().unwrap() = fail;
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
        self.texts.lock().unwrap().clear();
    }
}

impl NotificationSink for RecordingSink {
    async fn create(
        &self,
        recipient: SubscriberId,
        text: &str,
    ) -> Result<NotificationHandle, CreateError> {
        self.calls.lock().unwrap().push(Call::Create(recipient));
        self.texts.lock().unwrap().push(text.to_string());
        if *self.fail_creates.lock().unwrap() {
            return Err(CreateError("chat not found".into()));
        }
        Ok(NotificationHandle(self.next_handle.fetch_add(1, Relaxed) + 100))
    }

    async fn edit(
        &self,
        recipient: SubscriberId,
        handle: NotificationHandle,
        text: &str,
    ) -> Result<(), EditError> {
        self.calls.lock().unwrap().push(Call::Edit(recipient, handle));
        self.texts.lock().unwrap().push(text.to_string());
        self.edit_script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
