//! Atomic counters and histograms rendered as Prometheus text, plus the
//! `/health` and `/metrics` HTTP endpoints.
//!
//! Histograms use logarithmic 1-2-5 buckets from 1ms to 10s, the range of a
//! chat API round trip. No external metrics crate.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::Relaxed};
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broadcaster::PassReport;
use crate::error::Result;
use crate::price_table::PriceTable;
use crate::registry::Registry;
use crate::types::{Instrument, Instruments};

// ---------------------------------------------------------------------------
// Prometheus histogram with millisecond-resolution logarithmic buckets
// ---------------------------------------------------------------------------

const NUM_BUCKETS: usize = 13;

/// Upper bounds in microseconds + Prometheus `le` label strings.
const BUCKETS: [(u64, &str); NUM_BUCKETS] = [
    (1_000, "0.001"),
    (2_000, "0.002"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (20_000, "0.02"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (200_000, "0.2"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (2_000_000, "2"),
    (5_000_000, "5"),
    (10_000_000, "10"),
];

pub struct PromHistogram {
    /// Cumulative bucket counters. Index i counts observations <= BUCKETS[i].
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_us: AtomicU64,
    count: AtomicU64,
}

impl Default for PromHistogram {
    fn default() -> Self {
        Self::new()
    }
}

impl PromHistogram {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a duration observation. Increments all cumulative buckets
    /// whose upper bound >= the observed value.
    pub fn record(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        if let Some(first) = BUCKETS.iter().position(|&(bound, _)| micros <= bound) {
            for bucket in &self.buckets[first..] {
                bucket.fetch_add(1, Relaxed);
            }
        }

        self.sum_us.fetch_add(micros, Relaxed);
        self.count.fetch_add(1, Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    /// Render as Prometheus histogram lines. `labels` is empty or e.g. `instrument="BTC"`.
    fn render(&self, name: &str, labels: &str, out: &mut String) {
        let sep = if labels.is_empty() { "" } else { "," };
        for (i, &(_, le)) in BUCKETS.iter().enumerate() {
            let count = self.buckets[i].load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"{le}\"}} {count}");
        }

        let total = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {total}");

        #[allow(clippy::cast_precision_loss)]
        let sum_secs = self.sum_us.load(Relaxed) as f64 / 1_000_000.0;
        if labels.is_empty() {
            let _ = writeln!(out, "{name}_sum {sum_secs}");
            let _ = writeln!(out, "{name}_count {total}");
        } else {
            let _ = writeln!(out, "{name}_sum{{{labels}}} {sum_secs}");
            let _ = writeln!(out, "{name}_count{{{labels}}} {total}");
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Per-instrument feed connector metrics.
pub struct FeedMetrics {
    pub instrument: &'static str,
    pub ticks: AtomicU64,
    pub malformed: AtomicU64,
    pub errors: AtomicU64,
    pub reconnections: AtomicU64,
    pub connected: AtomicBool,
}

impl FeedMetrics {
    #[must_use]
    pub fn new(instrument: &'static str) -> Self {
        Self {
            instrument,
            ticks: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnections: AtomicU64::new(0),
            connected: AtomicBool::new(false),
        }
    }
}

pub struct Metrics {
    feeds: Vec<Arc<FeedMetrics>>,

    // Broadcaster
    pub passes: AtomicU64,
    pub signals_coalesced: AtomicU64,
    pub created: AtomicU64,
    pub edited: AtomicU64,
    pub recreated: AtomicU64,
    pub unchanged: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,

    // Persistence
    pub saves: AtomicU64,
    pub save_errors: AtomicU64,

    start_time: Instant,

    pub delivery_latency: PromHistogram,
    pub pass_latency: PromHistogram,
}

impl Metrics {
    /// One [`FeedMetrics`] per configured instrument.
    #[must_use]
    pub fn register(instruments: &Instruments) -> Self {
        Self {
            feeds: instruments
                .iter()
                .map(|i| Arc::new(FeedMetrics::new(i.code)))
                .collect(),
            passes: AtomicU64::new(0),
            signals_coalesced: AtomicU64::new(0),
            created: AtomicU64::new(0),
            edited: AtomicU64::new(0),
            recreated: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            save_errors: AtomicU64::new(0),
            start_time: Instant::now(),
            delivery_latency: PromHistogram::new(),
            pass_latency: PromHistogram::new(),
        }
    }

    /// Feed metrics for `instrument`. Unregistered instruments get a detached
    /// instance that is never rendered.
    #[must_use]
    pub fn feed(&self, instrument: &'static Instrument) -> Arc<FeedMetrics> {
        self.feeds
            .iter()
            .find(|f| f.instrument == instrument.code)
            .cloned()
            .unwrap_or_else(|| Arc::new(FeedMetrics::new(instrument.code)))
    }

    /// Number of feeds currently connected, and the total.
    #[must_use]
    pub fn feeds_connected(&self) -> (usize, usize) {
        let up = self.feeds.iter().filter(|f| f.connected.load(Relaxed)).count();
        (up, self.feeds.len())
    }

    pub fn record_pass(&self, report: &PassReport, elapsed: Duration) {
        self.passes.fetch_add(1, Relaxed);
        for (counter, n) in [
            (&self.created, report.created),
            (&self.edited, report.edited),
            (&self.recreated, report.recreated),
            (&self.unchanged, report.unchanged),
            (&self.skipped, report.skipped),
            (&self.failed, report.failed),
        ] {
            counter.fetch_add(n as u64, Relaxed);
        }
        self.pass_latency.record(elapsed);
    }

    /// Render all metrics in Prometheus text exposition format.
    #[must_use]
    pub fn to_prometheus(&self, registry: &Registry, prices: &PriceTable) -> String {
        let mut out = String::with_capacity(4096);

        // -- Feed counters --
        let feed_series: [(&str, &str, fn(&FeedMetrics) -> u64); 4] = [
            ("relay_ticks_total", "Price ticks applied to the price table", |f| f.ticks.load(Relaxed)),
            ("relay_malformed_ticks_total", "Ticker frames dropped as malformed", |f| f.malformed.load(Relaxed)),
            ("relay_feed_errors_total", "Connection and transport errors", |f| f.errors.load(Relaxed)),
            ("relay_reconnections_total", "Feed reconnection attempts", |f| f.reconnections.load(Relaxed)),
        ];
        for (name, help, pick) in feed_series {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            for f in &self.feeds {
                let _ = writeln!(out, "{name}{{instrument=\"{}\"}} {}", f.instrument, pick(f));
            }
        }

        // -- Broadcaster counters --
        let _ = writeln!(out, "# HELP relay_passes_total Broadcast passes run");
        let _ = writeln!(out, "# TYPE relay_passes_total counter");
        let _ = writeln!(out, "relay_passes_total {}", self.passes.load(Relaxed));

        let _ = writeln!(out, "# HELP relay_signals_coalesced_total Wake-ups dropped by the rate gate");
        let _ = writeln!(out, "# TYPE relay_signals_coalesced_total counter");
        let _ = writeln!(out, "relay_signals_coalesced_total {}", self.signals_coalesced.load(Relaxed));

        let _ = writeln!(out, "# HELP relay_deliveries_total Per-subscriber delivery outcomes");
        let _ = writeln!(out, "# TYPE relay_deliveries_total counter");
        for (outcome, counter) in [
            ("created", &self.created),
            ("edited", &self.edited),
            ("recreated", &self.recreated),
            ("unchanged", &self.unchanged),
            ("skipped", &self.skipped),
            ("failed", &self.failed),
        ] {
            let _ = writeln!(out, "relay_deliveries_total{{outcome=\"{outcome}\"}} {}", counter.load(Relaxed));
        }

        let _ = writeln!(out, "# HELP relay_state_saves_total Subscriber state saves");
        let _ = writeln!(out, "# TYPE relay_state_saves_total counter");
        let _ = writeln!(out, "relay_state_saves_total{{result=\"ok\"}} {}", self.saves.load(Relaxed));
        let _ = writeln!(out, "relay_state_saves_total{{result=\"error\"}} {}", self.save_errors.load(Relaxed));

        // -- Gauges --
        let _ = writeln!(out, "# HELP relay_feed_up Feed connection status (1=connected)");
        let _ = writeln!(out, "# TYPE relay_feed_up gauge");
        for f in &self.feeds {
            let _ = writeln!(out, "relay_feed_up{{instrument=\"{}\"}} {}", f.instrument, u8::from(f.connected.load(Relaxed)));
        }

        let _ = writeln!(out, "# HELP relay_price Latest observed price");
        let _ = writeln!(out, "# TYPE relay_price gauge");
        for f in &self.feeds {
            if let Some(price) = prices.get(f.instrument).and_then(|q| q.price) {
                let _ = writeln!(out, "relay_price{{instrument=\"{}\"}} {price}", f.instrument);
            }
        }

        let _ = writeln!(out, "# HELP relay_instruments_priced Instruments that have received a tick");
        let _ = writeln!(out, "# TYPE relay_instruments_priced gauge");
        let _ = writeln!(out, "relay_instruments_priced {}", prices.priced_count());

        let _ = writeln!(out, "# HELP relay_subscribers Known subscribers");
        let _ = writeln!(out, "# TYPE relay_subscribers gauge");
        let _ = writeln!(out, "relay_subscribers{{state=\"active\"}} {}", registry.active_count());
        let _ = writeln!(out, "relay_subscribers{{state=\"all\"}} {}", registry.len());

        let _ = writeln!(out, "# HELP relay_uptime_seconds Seconds since process start");
        let _ = writeln!(out, "# TYPE relay_uptime_seconds gauge");
        let _ = writeln!(out, "relay_uptime_seconds {}", self.start_time.elapsed().as_secs());

        // -- Histograms --
        let _ = writeln!(out, "# HELP relay_delivery_duration_seconds Sink create/edit round trip");
        let _ = writeln!(out, "# TYPE relay_delivery_duration_seconds histogram");
        self.delivery_latency.render("relay_delivery_duration_seconds", "", &mut out);

        let _ = writeln!(out, "# HELP relay_pass_duration_seconds Full broadcast pass");
        let _ = writeln!(out, "# TYPE relay_pass_duration_seconds histogram");
        self.pass_latency.render("relay_pass_duration_seconds", "", &mut out);

        out
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HttpState {
    pub metrics: Arc<Metrics>,
    pub registry: Arc<Registry>,
    pub prices: Arc<PriceTable>,
}

/// Build the `/health` + `/metrics` router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prom_metrics))
        .with_state(state)
}

/// Serve `/health` and `/metrics` on the given port until cancelled.
pub async fn serve_http(port: u16, state: HttpState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;

    info!(port, "metrics/health HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn health(State(s): State<HttpState>) -> (StatusCode, &'static str) {
    health_status(&s.metrics)
}

fn health_status(m: &Metrics) -> (StatusCode, &'static str) {
    match m.feeds_connected() {
        (_, 0) => (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n"),
        (up, total) if up == total => (StatusCode::OK, "OK\n"),
        (0, _) => (StatusCode::SERVICE_UNAVAILABLE, "DOWN\n"),
        _ => (StatusCode::OK, "DEGRADED\n"),
    }
}

async fn prom_metrics(State(s): State<HttpState>) -> String {
    s.metrics.to_prometheus(&s.registry, &s.prices)
}
