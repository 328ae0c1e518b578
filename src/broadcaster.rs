//! Broadcaster.
//!
//! Waits on the ingestion signal, lets at most one pass through per minimum
//! update interval (a single global checkpoint shared by all instruments), and
//! on each pass fans deliveries out to every active subscriber with a bounded
//! number in flight. Signals that arrive while the gate is closed are dropped.
//!
//! Each delivery reads a snapshot of the subscriber taken at the start of the
//! pass and writes back through [`Registry::record_delivery`], which rejects
//! results planned against bookkeeping that has since been reset.

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::delivery::{DEFAULT_DEDUP_THRESHOLD, Decision, Outcome, SkipReason, decide};
use crate::metrics::Metrics;
use crate::price_table::PriceTable;
use crate::registry::Registry;
use crate::signal::SignalReceiver;
use crate::sink::{EditError, NotificationSink, render};
use crate::types::{Instrument, NotificationHandle, PriceQuote, Subscriber};

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Global floor between two passes.
    pub min_update_interval: Duration,
    /// Minimum price move that justifies an edit.
    pub dedup_threshold: Decimal,
    /// Deliveries in flight at once during a pass.
    pub max_in_flight: usize,
    /// Upper bound on a single create/edit round trip.
    pub delivery_timeout: Duration,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            min_update_interval: Duration::from_secs(1),
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            max_in_flight: 32,
            delivery_timeout: Duration::from_secs(10),
        }
    }
}

/// Minimum-interval gate. Opens at most once per `min_interval`.
#[derive(Debug)]
pub struct RateGate {
    min_interval: Duration,
    last_pass: Option<Instant>,
}

impl RateGate {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: None,
        }
    }

    /// Returns `true` and records `now` if a pass may run.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_pass
            && now.saturating_duration_since(last) < self.min_interval
        {
            return false;
        }
        self.last_pass = Some(now);
        true
    }
}

/// Per-outcome counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub created: usize,
    pub edited: usize,
    pub recreated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Edited => self.edited += 1,
            Outcome::Recreated => self.recreated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Skipped(_) => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.created + self.edited + self.recreated + self.unchanged + self.skipped + self.failed
    }
}

pub struct Broadcaster<S> {
    prices: Arc<PriceTable>,
    registry: Arc<Registry>,
    sink: Arc<S>,
    config: BroadcastConfig,
    metrics: Arc<Metrics>,
}

impl<S: NotificationSink> Broadcaster<S> {
    #[must_use]
    pub fn new(
        prices: Arc<PriceTable>,
        registry: Arc<Registry>,
        sink: Arc<S>,
        config: BroadcastConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            prices,
            registry,
            sink,
            config,
            metrics,
        }
    }

    /// Run until cancelled or every signal sender is dropped.
    pub async fn run(self, mut signals: SignalReceiver, cancel: CancellationToken) {
        let mut gate = RateGate::new(self.config.min_update_interval);
        info!(
            min_interval = ?self.config.min_update_interval,
            threshold = %self.config.dedup_threshold,
            max_in_flight = self.config.max_in_flight,
            "broadcaster started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("broadcaster cancelled");
                    break;
                }
                signal = signals.recv() => {
                    if signal.is_none() {
                        info!("all signal senders dropped, broadcaster exiting");
                        break;
                    }
                }
            }

            if !gate.try_acquire(Instant::now()) {
                self.metrics.signals_coalesced.fetch_add(1, Relaxed);
                continue;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("broadcaster cancelled mid-pass");
                    break;
                }
                report = self.pass() => {
                    if report.total() > 0 {
                        debug!(
                            created = report.created,
                            edited = report.edited,
                            recreated = report.recreated,
                            skipped = report.skipped,
                            failed = report.failed,
                            "pass complete"
                        );
                    }
                }
            }
        }
    }

    /// One broadcast pass over every active subscriber.
    pub async fn pass(&self) -> PassReport {
        let t0 = Instant::now();
        let mut jobs = Vec::new();
        for (code, subscribers) in self.registry.active_by_instrument() {
            let (Some(instrument), Some(quote)) =
                (self.registry.instruments().get(code), self.prices.get(code))
            else {
                continue;
            };
            jobs.extend(subscribers.into_iter().map(|sub| (instrument, quote, sub)));
        }

        let mut report = PassReport::default();
        let mut pending = jobs.into_iter();
        let mut in_flight = FuturesUnordered::new();
        for (instrument, quote, sub) in pending.by_ref().take(self.config.max_in_flight.max(1)) {
            in_flight.push(self.deliver_bounded(instrument, quote, sub));
        }
        while let Some(outcome) = in_flight.next().await {
            report.record(outcome);
            if let Some((instrument, quote, sub)) = pending.next() {
                in_flight.push(self.deliver_bounded(instrument, quote, sub));
            }
        }

        self.metrics.record_pass(&report, t0.elapsed());
        report
    }

    async fn deliver_bounded(
        &self,
        instrument: &'static Instrument,
        quote: PriceQuote,
        sub: Subscriber,
    ) -> Outcome {
        let id = sub.id;
        match tokio::time::timeout(self.config.delivery_timeout, self.deliver(instrument, quote, sub)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(subscriber = %id, instrument = instrument.code, "delivery timed out");
                Outcome::Failed
            }
        }
    }

    /// Apply the delivery decision for one subscriber.
    async fn deliver(
        &self,
        instrument: &'static Instrument,
        quote: PriceQuote,
        sub: Subscriber,
    ) -> Outcome {
        let (price, handle) = match decide(&quote, &sub, self.config.dedup_threshold) {
            Decision::Skip(reason) => return Outcome::Skipped(reason),
            Decision::Create { price } => (price, None),
            Decision::Edit { handle, price } => (price, Some(handle)),
        };
        let Some(text) = render(instrument, &quote) else {
            return Outcome::Skipped(SkipReason::NoPrice);
        };

        let t0 = Instant::now();
        let outcome = match handle {
            None => {
                if self.create(&sub, price, &text).await {
                    Outcome::Created
                } else {
                    Outcome::Failed
                }
            }
            Some(handle) => self.edit(&sub, handle, price, &text).await,
        };
        self.metrics.delivery_latency.record(t0.elapsed());
        outcome
    }

    async fn create(&self, sub: &Subscriber, price: Decimal, text: &str) -> bool {
        match self.sink.create(sub.id, text).await {
            Ok(handle) => {
                self.registry.record_delivery(sub.id, sub.generation, handle, price);
                debug!(subscriber = %sub.id, %handle, %price, "notification created");
                true
            }
            Err(e) => {
                warn!(subscriber = %sub.id, error = %e, "create failed");
                false
            }
        }
    }

    async fn edit(
        &self,
        sub: &Subscriber,
        handle: NotificationHandle,
        price: Decimal,
        text: &str,
    ) -> Outcome {
        match self.sink.edit(sub.id, handle, text).await {
            Ok(()) => {
                self.registry.record_delivery(sub.id, sub.generation, handle, price);
                Outcome::Edited
            }
            Err(EditError::NotFound) => {
                info!(subscriber = %sub.id, %handle, "notification gone, sending a new one");
                if self.create(sub, price, text).await {
                    Outcome::Recreated
                } else {
                    self.registry.forget_handle(sub.id, sub.generation, handle);
                    Outcome::Failed
                }
            }
            Err(EditError::Unchanged) => Outcome::Unchanged,
            Err(EditError::Other(e)) => {
                warn!(subscriber = %sub.id, %handle, error = %e, "edit failed");
                Outcome::Failed
            }
        }
    }
}
