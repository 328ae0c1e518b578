//! Feed connectors.
//!
//! One connector per instrument owns a websocket to the venue's ticker
//! stream, writes each tick into the [`PriceTable`] and nudges the
//! broadcaster. The connection loop never gives up: a clean close waits the
//! reconnection delay, anything else waits twice that, with no growth and no
//! jitter. Cancellation is observed while consuming and while sleeping.

pub mod ticker;

use std::sync::Arc;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio_tungstenite::connect_async_tls_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::FeedMetrics;
use crate::price_table::PriceTable;
use crate::signal::SignalSender;
use crate::types::Instrument;

pub use ticker::parse_ticker;

/// Upper bound on the websocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer close frame or end of stream.
    Clean,
    /// Connect failure, connect timeout, or transport/protocol error.
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay_for(&self, disconnect: Disconnect) -> Duration {
        match disconnect {
            Disconnect::Clean => self.reconnect_delay,
            Disconnect::Error => self.reconnect_delay * 2,
        }
    }
}

/// Ticker stream URL for `instrument` under `base` (e.g. `wss://host/ws`).
#[must_use]
pub fn stream_url(base: &str, instrument: &Instrument) -> String {
    format!("{}/{}@ticker", base.trim_end_matches('/'), instrument.pair)
}

pub struct FeedConnector {
    instrument: &'static Instrument,
    url: String,
    prices: Arc<PriceTable>,
    signal: SignalSender,
    policy: RetryPolicy,
    metrics: Arc<FeedMetrics>,
}

impl FeedConnector {
    #[must_use]
    pub fn new(
        instrument: &'static Instrument,
        base_url: &str,
        prices: Arc<PriceTable>,
        signal: SignalSender,
        policy: RetryPolicy,
        metrics: Arc<FeedMetrics>,
    ) -> Self {
        Self {
            instrument,
            url: stream_url(base_url, instrument),
            prices,
            signal,
            policy,
            metrics,
        }
    }

    /// Connect, consume, reconnect. Returns only on cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        let code = self.instrument.code;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let Some(disconnect) = self.session(&cancel).await else {
                info!(instrument = code, "feed shutting down");
                return;
            };

            let delay = self.policy.delay_for(disconnect);
            self.metrics.reconnections.fetch_add(1, Relaxed);
            info!(instrument = code, ?disconnect, ?delay, "reconnecting");

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(instrument = code, "feed shutting down");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime. `None` when cancelled.
    async fn session(&self, cancel: &CancellationToken) -> Option<Disconnect> {
        let code = self.instrument.code;
        info!(instrument = code, url = %self.url, "connecting");

        let connect = connect_async_tls_with_config(&self.url, None, true, None);
        let ws = tokio::select! {
            () = cancel.cancelled() => return None,
            res = tokio::time::timeout(self.policy.connect_timeout, connect) => match res {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    self.metrics.errors.fetch_add(1, Relaxed);
                    error!(instrument = code, error = %e, "connection failed");
                    return Some(Disconnect::Error);
                }
                Err(_) => {
                    self.metrics.errors.fetch_add(1, Relaxed);
                    error!(instrument = code, "connection timed out");
                    return Some(Disconnect::Error);
                }
            }
        };

        info!(instrument = code, "connected");
        self.metrics.connected.store(true, Relaxed);
        let (_write, mut read) = ws.split();

        let outcome = loop {
            let text = tokio::select! {
                () = cancel.cancelled() => break None,
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(frame))) => {
                        info!(instrument = code, ?frame, "peer closed stream");
                        break Some(Disconnect::Clean);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        self.metrics.errors.fetch_add(1, Relaxed);
                        warn!(instrument = code, error = %e, "ws error");
                        break Some(Disconnect::Error);
                    }
                    None => {
                        info!(instrument = code, "stream ended");
                        break Some(Disconnect::Clean);
                    }
                }
            };
            self.apply(&text);
        };

        self.metrics.connected.store(false, Relaxed);
        outcome
    }

    /// Apply one ticker frame. Malformed frames are counted and dropped.
    fn apply(&self, text: &str) -> bool {
        let Some(price) = parse_ticker(text) else {
            self.metrics.malformed.fetch_add(1, Relaxed);
            warn!(
                instrument = self.instrument.code,
                payload_head = head(text, 200),
                "malformed tick"
            );
            return false;
        };
        self.prices.set(self.instrument.code, price, Utc::now());
        self.metrics.ticks.fetch_add(1, Relaxed);
        if !self.signal.notify() {
            debug!(instrument = self.instrument.code, "broadcast already pending");
        }
        true
    }
}

/// First `n` characters of `text`, for log lines.
fn head(text: &str, n: usize) -> &str {
    text.char_indices().nth(n).map_or(text, |(i, _)| &text[..i])
}
