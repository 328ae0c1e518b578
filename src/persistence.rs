//! Durable subscriber state.
//!
//! Only `{active, instrument, portfolio}` is stored. Delivery bookkeeping
//! (handles, last delivered price) never reaches disk, so a restart always
//! begins with fresh notifications.
//!
//! Writes are atomic: serialize, write a sibling `.tmp`, fsync, rename.
//! Saves are serialized by an async mutex and the registry snapshot is taken
//! while holding it, so the last save to finish always carries the newest
//! state.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::registry::{Registry, RestoredSubscriber};
use crate::types::{Instruments, Portfolio, SubscriberId};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    #[serde(default)]
    active: bool,
    #[serde(default, alias = "crypto")]
    instrument: String,
    #[serde(default)]
    portfolio: Portfolio,
}

pub struct SubscriberStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SubscriberStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every subscriber's durable fields.
    pub async fn save(&self, registry: &Registry) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let records: BTreeMap<String, Record> = registry
            .snapshot()
            .iter()
            .map(|s| {
                let record = Record {
                    active: s.active,
                    instrument: s.instrument.code.to_string(),
                    portfolio: s.portfolio.clone(),
                };
                (s.id.to_string(), record)
            })
            .collect();
        let data = serde_json::to_vec_pretty(&records)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp_path = tmp_path(&self.path);
        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await?;

        debug!(path = %self.path.display(), subscribers = records.len(), "state saved");
        Ok(records.len())
    }

    /// Read persisted subscribers. A missing file is an empty registry; an
    /// unreadable or corrupt one is logged and also treated as empty.
    pub async fn load(&self, instruments: &Instruments) -> Vec<RestoredSubscriber> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no saved state, starting empty");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read saved state");
                return Vec::new();
            }
        };

        let records: BTreeMap<String, Record> = match serde_json::from_slice(&data) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt saved state, starting empty");
                return Vec::new();
            }
        };

        let restored: Vec<RestoredSubscriber> = records
            .into_iter()
            .filter_map(|(key, record)| restore(&key, record, instruments))
            .collect();
        info!(path = %self.path.display(), subscribers = restored.len(), "state loaded");
        restored
    }
}

fn restore(key: &str, record: Record, instruments: &Instruments) -> Option<RestoredSubscriber> {
    let Ok(id) = key.parse::<i64>() else {
        warn!(key, "skipping record with non-numeric id");
        return None;
    };
    let instrument = instruments.get(&record.instrument).unwrap_or_else(|| {
        let fallback = instruments.default_instrument();
        if !record.instrument.is_empty() {
            warn!(
                subscriber = id,
                instrument = %record.instrument,
                fallback = fallback.code,
                "saved instrument no longer offered"
            );
        }
        fallback
    });
    Some(RestoredSubscriber {
        id: SubscriberId(id),
        active: record.active,
        instrument,
        portfolio: record.portfolio,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::testutil::{instruments, price};
    use crate::types::NotificationHandle;

    #[tokio::test]
    async fn round_trip_drops_delivery_state() {
        let dir = TempDir::new().unwrap();
        let store = SubscriberStore::new(dir.path().join("nested/users_data.json"));
        let reg = Registry::new(instruments());

        reg.set_active(SubscriberId(1), true);
        reg.set_instrument(SubscriberId(1), "SOL").unwrap();
        let generation = reg.get_or_create(SubscriberId(1)).generation;
        reg.record_delivery(SubscriberId(1), generation, NotificationHandle(77), price("140.1"));
        reg.update_portfolio(SubscriberId(2), |p| p.insert("ETH".into(), 1.5));

        assert_eq!(store.save(&reg).await.unwrap(), 2);
        assert!(!tmp_path(store.path()).exists());

        let restored = store.load(&instruments()).await;
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].id, SubscriberId(1));
        assert!(restored[0].active);
        assert_eq!(restored[0].instrument.code, "SOL");
        assert!(!restored[1].active);
        assert_eq!(restored[1].portfolio["ETH"], 1.5);

        let fresh = Registry::new(instruments());
        fresh.hydrate(restored);
        let sub = fresh.get_or_create(SubscriberId(1));
        assert_eq!(sub.notification_handle, None);
        assert_eq!(sub.last_delivered_price, None);

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"1\""));
        assert!(!raw.contains("77"));
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SubscriberStore::new(dir.path().join("absent.json"));
        assert!(store.load(&instruments()).await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users_data.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = SubscriberStore::new(&path);
        assert!(store.load(&instruments()).await.is_empty());
    }

    #[tokio::test]
    async fn accepts_legacy_key_and_unknown_instrument() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("users_data.json");
        std::fs::write(
            &path,
            r#"{
                "10": {"active": true, "crypto": "ETH", "portfolio": {}},
                "-20": {"active": false, "instrument": "DOGE"},
                "abc": {"active": true, "instrument": "BTC"},
                "30": {}
            }"#,
        )
        .unwrap();
        let store = SubscriberStore::new(&path);
        let mut restored = store.load(&instruments()).await;
        restored.sort_by_key(|r| r.id);

        let codes: Vec<_> = restored.iter().map(|r| (r.id.0, r.instrument.code, r.active)).collect();
        assert_eq!(codes, vec![(-20, "BTC", false), (10, "ETH", true), (30, "BTC", false)]);
    }

    #[tokio::test]
    async fn concurrent_saves_leave_a_valid_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SubscriberStore::new(dir.path().join("users_data.json")));
        let reg = Arc::new(Registry::new(instruments()));
        for i in 0..50 {
            reg.set_active(SubscriberId(i), i % 2 == 0);
        }

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let reg = reg.clone();
                tokio::spawn(async move { store.save(&reg).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let restored = store.load(&instruments()).await;
        assert_eq!(restored.len(), 50);
        assert_eq!(restored.iter().filter(|r| r.active).count(), 25);
    }
}
