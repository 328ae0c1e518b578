//! CLI configuration via clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rust_decimal::Decimal;

use crate::broadcaster::BroadcastConfig;
use crate::error::Result;
use crate::feed::{CONNECT_TIMEOUT, RetryPolicy};
use crate::types::Instruments;

#[derive(Parser, Debug, Clone)]
#[command(name = "price-relay")]
#[command(about = "Streams live instrument prices from exchange websockets and relays them as updating notifications")]
pub struct Config {
    /// Instrument codes to track (comma separated)
    #[arg(long, env = "RELAY_INSTRUMENTS", value_delimiter = ',', default_value = "BTC,ETH,SOL,XRP")]
    pub instruments: Vec<String>,

    /// Instrument assigned to new subscribers
    #[arg(long, env = "RELAY_DEFAULT_INSTRUMENT", default_value = "BTC")]
    pub default_instrument: String,

    /// Base websocket URL; `/<pair>@ticker` is appended per instrument
    #[arg(long, env = "RELAY_FEED_URL", default_value = "wss://stream.binance.com:9443/ws")]
    pub feed_url: String,

    /// Delay before reconnecting after a clean close (doubled after errors)
    #[arg(long, env = "RELAY_RECONNECT_DELAY_MS", default_value = "5000")]
    pub reconnect_delay_ms: u64,

    /// Minimum time between two broadcast passes
    #[arg(long, env = "RELAY_MIN_UPDATE_INTERVAL_MS", default_value = "1000")]
    pub min_update_interval_ms: u64,

    /// Minimum price move that triggers an edit
    #[arg(long, env = "RELAY_DEDUP_THRESHOLD", default_value = "0.01")]
    pub dedup_threshold: Decimal,

    /// Deliveries in flight at once during a pass
    #[arg(long, env = "RELAY_MAX_IN_FLIGHT", default_value = "32")]
    pub max_in_flight: usize,

    /// Upper bound on a single delivery
    #[arg(long, env = "RELAY_DELIVERY_TIMEOUT_MS", default_value = "10000")]
    pub delivery_timeout_ms: u64,

    /// How long shutdown waits for tasks to finish
    #[arg(long, env = "RELAY_SHUTDOWN_GRACE_MS", default_value = "5000")]
    pub shutdown_grace_ms: u64,

    /// Subscriber state file
    #[arg(long, env = "RELAY_STATE_FILE", default_value = "data/users_data.json")]
    pub state_file: PathBuf,

    /// Metrics/health HTTP port
    #[arg(long, env = "RELAY_METRICS_PORT", default_value = "9100")]
    pub metrics_port: u16,

    /// Telegram bot token. Without it notifications are only logged.
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    pub bot_token: Option<String>,

    /// Telegram Bot API base URL
    #[arg(long, env = "RELAY_TELEGRAM_API", default_value = "https://api.telegram.org")]
    pub telegram_api: String,
}

impl Config {
    /// Validated instrument set.
    pub fn instrument_set(&self) -> Result<Instruments> {
        Instruments::new(&self.instruments, &self.default_instrument)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            min_update_interval: Duration::from_millis(self.min_update_interval_ms),
            dedup_threshold: self.dedup_threshold,
            max_in_flight: self.max_in_flight,
            delivery_timeout: Duration::from_millis(self.delivery_timeout_ms),
        }
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
