use std::sync::Arc;

use clap::Parser;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use price_relay::broadcaster::{BroadcastConfig, Broadcaster};
use price_relay::config::Config;
use price_relay::feed::FeedConnector;
use price_relay::metrics::{self, HttpState, Metrics};
use price_relay::persistence::SubscriberStore;
use price_relay::price_table::PriceTable;
use price_relay::registry::Registry;
use price_relay::relay::Relay;
use price_relay::signal::{SignalReceiver, signal};
use price_relay::sink::NotificationSink;
use price_relay::sink::log::LogSink;
use price_relay::sink::telegram::TelegramSink;

fn spawn_broadcaster<S: NotificationSink>(
    sink: S,
    prices: Arc<PriceTable>,
    registry: Arc<Registry>,
    config: BroadcastConfig,
    metrics: Arc<Metrics>,
    signals: SignalReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let broadcaster = Broadcaster::new(prices, registry, Arc::new(sink), config, metrics);
    tokio::spawn(broadcaster.run(signals, cancel))
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let instruments = config.instrument_set()?;
    info!(
        instruments = ?instruments.iter().map(|i| i.code).collect::<Vec<_>>(),
        default = instruments.default_instrument().code,
        feed_url = %config.feed_url,
        metrics_port = config.metrics_port,
        "starting price relay"
    );

    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::register(&instruments));
    let prices = Arc::new(PriceTable::new(&instruments));
    let registry = Arc::new(Registry::new(instruments.clone()));
    let store = Arc::new(SubscriberStore::new(&config.state_file));

    registry.hydrate(store.load(&instruments).await);
    info!(
        subscribers = registry.len(),
        active = registry.active_count(),
        "registry hydrated"
    );

    // Feed connectors -> broadcaster wake-up (single slot, drop-on-full).
    let (signal_tx, signal_rx) = signal();
    let relay = Relay::new(
        prices.clone(),
        registry.clone(),
        store,
        signal_tx.clone(),
        metrics.clone(),
    );

    let mut handles: Vec<JoinHandle<()>> = instruments
        .iter()
        .map(|instrument| {
            let connector = FeedConnector::new(
                instrument,
                &config.feed_url,
                prices.clone(),
                signal_tx.clone(),
                config.retry_policy(),
                metrics.feed(instrument),
            );
            tokio::spawn(connector.run(cancel.clone()))
        })
        .collect();
    drop(signal_tx);

    let broadcast = config.broadcast_config();
    handles.push(match config.bot_token.as_deref() {
        Some(token) => {
            info!(api = %config.telegram_api, "delivering via Telegram");
            spawn_broadcaster(
                TelegramSink::new(&config.telegram_api, token)?,
                prices.clone(),
                registry.clone(),
                broadcast,
                metrics.clone(),
                signal_rx,
                cancel.clone(),
            )
        }
        None => {
            warn!("no bot token configured, notifications will only be logged");
            spawn_broadcaster(
                LogSink::new(),
                prices.clone(),
                registry.clone(),
                broadcast,
                metrics.clone(),
                signal_rx,
                cancel.clone(),
            )
        }
    });

    handles.push({
        let state = HttpState {
            metrics: metrics.clone(),
            registry: registry.clone(),
            prices: prices.clone(),
        };
        let cancel = cancel.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve_http(port, state, cancel).await {
                tracing::error!(port, error = %e, "metrics server failed");
            }
        })
    });

    if let Err(e) = shutdown_signal().await {
        warn!(error = %e, "signal handler failed, shutting down");
    }
    info!("received shutdown signal, draining");
    cancel.cancel();

    let grace = config.shutdown_grace();
    if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
        warn!(?grace, "tasks still running after grace period");
    }

    relay.persist().await;
    info!("shutdown complete");
    Ok(())
}
