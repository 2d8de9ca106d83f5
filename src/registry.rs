//! Leader registry (C2): per-device files plus the single shared
//! StateRecord, per spec §3.1/§4.2.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::store::SharedStore;

const STALE_DEVICE_THRESHOLD_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub name: String,
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub last_seen: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    #[serde(default)]
    pub active_device: Option<String>,
    #[serde(default)]
    pub active_device_heartbeat: i64,
    #[serde(default)]
    pub last_update_id: i64,
    #[serde(default)]
    pub last_modified: i64,
    #[serde(default)]
    pub modified_by: Option<String>,
    #[serde(default)]
    pub foreign_chat_ids: Vec<i64>,
}

const STATE_FILE: &str = "state.json";

fn device_file(sanitized_id: &str) -> String {
    format!("devices/{sanitized_id}.json")
}

pub struct Registry<'a> {
    store: &'a SharedStore,
}

impl<'a> Registry<'a> {
    pub fn new(store: &'a SharedStore) -> Self {
        Registry { store }
    }

    pub async fn read_state(&self) -> Result<StateRecord, BridgeError> {
        Ok(self.store.read(STATE_FILE).await?.unwrap_or_default())
    }

    pub async fn write_state(&self, state: &StateRecord) -> Result<(), BridgeError> {
        self.store.write(STATE_FILE, state).await
    }

    pub async fn write_device(&self, sanitized_id: &str, record: &DeviceRecord) -> Result<(), BridgeError> {
        self.store.write(&device_file(sanitized_id), record).await
    }

    /// Reads every `devices/*.json`, skipping malformed entries, sorted
    /// active-device-first then by `lastSeen` descending, 1-numbered.
    pub async fn list_devices(&self, active_device: Option<&str>) -> Result<Vec<(usize, DeviceRecord)>, BridgeError> {
        let raw = self.store.list_json("devices").await?;
        let mut records: Vec<DeviceRecord> = raw
            .into_iter()
            .filter_map(|(stem, value)| match serde_json::from_value::<DeviceRecord>(value) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(device = %stem, error = %e, "skipping malformed device record");
                    None
                }
            })
            .collect();

        records.sort_by(|a, b| {
            let a_active = active_device == Some(a.name.as_str());
            let b_active = active_device == Some(b.name.as_str());
            b_active.cmp(&a_active).then(b.last_seen.cmp(&a.last_seen))
        });

        Ok(records.into_iter().enumerate().map(|(i, r)| (i + 1, r)).collect())
    }

    /// Removes DeviceRecord files whose `lastSeen` is older than the
    /// stale-device threshold (24h, spec §3.1 I4).
    pub async fn sweep_stale_devices(&self, now_ms: i64) -> Result<usize, BridgeError> {
        let raw = self.store.list_json("devices").await?;
        let mut removed = 0;
        for (stem, value) in raw {
            let Ok(record) = serde_json::from_value::<DeviceRecord>(value) else {
                continue;
            };
            if now_ms - record.last_seen > STALE_DEVICE_THRESHOLD_MS {
                self.store.delete(&device_file(&stem)).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn remove_device(&self, sanitized_id: &str) -> Result<(), BridgeError> {
        self.store.delete(&device_file(sanitized_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn read_state_defaults_when_missing() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        let state = registry.read_state().await.unwrap();
        assert_eq!(state.active_device, None);
        assert_eq!(state.last_update_id, 0);
    }

    #[tokio::test]
    async fn write_then_read_state_round_trips() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        let mut state = StateRecord::default();
        state.active_device = Some("dev-a".into());
        state.last_update_id = 42;
        registry.write_state(&state).await.unwrap();
        assert_eq!(registry.read_state().await.unwrap(), state);
    }

    #[tokio::test]
    async fn list_devices_sorts_active_first_then_by_last_seen() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_device(
                "a",
                &DeviceRecord {
                    name: "a".into(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/x".into(),
                    pid: 1,
                    last_seen: 100,
                },
            )
            .await
            .unwrap();
        registry
            .write_device(
                "b",
                &DeviceRecord {
                    name: "b".into(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/y".into(),
                    pid: 2,
                    last_seen: 200,
                },
            )
            .await
            .unwrap();
        let listed = registry.list_devices(Some("a")).await.unwrap();
        assert_eq!(listed[0].1.name, "a");
        assert_eq!(listed[0].0, 1);
        assert_eq!(listed[1].1.name, "b");
    }

    #[tokio::test]
    async fn list_devices_skips_malformed_and_keeps_good_ones() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("devices")).unwrap();
        std::fs::write(dir.path().join("devices/bad.json"), b"{not json").unwrap();
        let registry = Registry::new(&store);
        registry
            .write_device(
                "a",
                &DeviceRecord {
                    name: "a".into(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/x".into(),
                    pid: 1,
                    last_seen: 1,
                },
            )
            .await
            .unwrap();
        let listed = registry.list_devices(None).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_devices() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_device(
                "old",
                &DeviceRecord {
                    name: "old".into(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/x".into(),
                    pid: 1,
                    last_seen: 0,
                },
            )
            .await
            .unwrap();
        registry
            .write_device(
                "fresh",
                &DeviceRecord {
                    name: "fresh".into(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/y".into(),
                    pid: 2,
                    last_seen: STALE_DEVICE_THRESHOLD_MS * 2,
                },
            )
            .await
            .unwrap();
        let removed = registry.sweep_stale_devices(STALE_DEVICE_THRESHOLD_MS * 2).await.unwrap();
        assert_eq!(removed, 1);
        let listed = registry.list_devices(None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.name, "fresh");
    }
}
