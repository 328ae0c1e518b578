//! End-to-end: local ticker websocket → feed connector → price table →
//! broadcaster → recording sink.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use price_relay::broadcaster::{BroadcastConfig, Broadcaster};
use price_relay::feed::{FeedConnector, RetryPolicy};
use price_relay::metrics::Metrics;
use price_relay::persistence::SubscriberStore;
use price_relay::price_table::PriceTable;
use price_relay::registry::Registry;
use price_relay::relay::Relay;
use price_relay::signal::signal;
use price_relay::sink::{CreateError, EditError, NotificationSink};
use price_relay::types::{Instruments, NotificationHandle, SubscriberId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sent {
    Create(SubscriberId, String),
    Edit(SubscriberId, NotificationHandle, String),
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Sent>>,
}

impl Recorder {
    fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }
}

impl NotificationSink for Recorder {
    async fn create(&self, recipient: SubscriberId, text: &str) -> Result<NotificationHandle, CreateError> {
        self.sent.lock().unwrap().push(Sent::Create(recipient, text.to_string()));
        Ok(NotificationHandle(500))
    }

    async fn edit(
        &self,
        recipient: SubscriberId,
        handle: NotificationHandle,
        text: &str,
    ) -> Result<(), EditError> {
        self.sent.lock().unwrap().push(Sent::Edit(recipient, handle, text.to_string()));
        Ok(())
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn ticks_drive_one_create_then_one_edit() {
    // Ticker server: pushes whatever the test feeds into `frames`.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(frame) = frames_rx.recv().await {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        let _ = ws.close(None).await;
        while ws.next().await.is_some() {}
    });

    let instruments = Instruments::new(&["BTC"], "BTC").unwrap();
    let btc = instruments.get("BTC").unwrap();
    let cancel = CancellationToken::new();
    let metrics = Arc::new(Metrics::register(&instruments));
    let prices = Arc::new(PriceTable::new(&instruments));
    let registry = Arc::new(Registry::new(instruments.clone()));
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SubscriberStore::new(dir.path().join("users_data.json")));
    let sink = Arc::new(Recorder::default());
    let (signal_tx, signal_rx) = signal();

    let relay = Relay::new(prices.clone(), registry.clone(), store, signal_tx.clone(), metrics.clone());
    let user = SubscriberId(1001);
    relay.start_updates(user).await;

    let connector = FeedConnector::new(
        btc,
        &format!("ws://{addr}"),
        prices.clone(),
        signal_tx,
        RetryPolicy {
            reconnect_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
        },
        metrics.feed(btc),
    );
    let feed = tokio::spawn(connector.run(cancel.clone()));

    let config = BroadcastConfig {
        min_update_interval: Duration::from_millis(50),
        ..BroadcastConfig::default()
    };
    let broadcaster = Broadcaster::new(prices.clone(), registry.clone(), sink.clone(), config, metrics.clone());
    let broadcast = tokio::spawn(broadcaster.run(signal_rx, cancel.clone()));

    // The activation nudge runs an empty pass first; let the gate reopen.
    let feed_metrics = metrics.feed(btc);
    wait_until("feed connection", || feed_metrics.connected.load(Ordering::Relaxed)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    frames_tx.send(r#"{"e":"24hrTicker","s":"BTCEUR","c":"50000.00"}"#.into()).unwrap();
    wait_until("first notification", || !sink.sent().is_empty()).await;
    let sent = sink.sent();
    let Sent::Create(id, text) = &sent[0] else {
        panic!("expected a create, got {sent:?}");
    };
    assert_eq!(*id, user);
    assert!(text.starts_with("₿ BTC/EUR: 50000.00\nUpdated: "), "{text}");

    // Let the rate gate reopen, then move the price.
    tokio::time::sleep(Duration::from_millis(100)).await;
    frames_tx.send(r#"{"e":"24hrTicker","s":"BTCEUR","c":"50000.004"}"#.into()).unwrap();
    frames_tx.send("garbage".into()).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    frames_tx.send(r#"{"e":"24hrTicker","s":"BTCEUR","c":"50010.50"}"#.into()).unwrap();
    wait_until("edit", || sink.sent().len() >= 2).await;

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    let Sent::Edit(id, handle, text) = &sent[1] else {
        panic!("expected an edit, got {:?}", sent[1]);
    };
    assert_eq!(*id, user);
    assert_eq!(*handle, NotificationHandle(500));
    assert!(text.starts_with("₿ BTC/EUR: 50010.50"));

    let sub = relay.subscriber(user);
    assert_eq!(sub.notification_handle, Some(NotificationHandle(500)));
    assert_eq!(sub.last_delivered_price.map(|p| p.to_string()).as_deref(), Some("50010.50"));

    cancel.cancel();
    feed.await.unwrap();
    broadcast.await.unwrap();
}
