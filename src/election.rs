//! Election and failover (C3), spec §4.3.
//!
//! State machine per instance: `Standby -> CandidatingAfterStale -> Leader
//! -> Standby` (on loss), or `Standby` forever if the shared store is
//! disabled (`USE_ICLOUD_COORDINATOR=0`, in which case the instance is
//! permanently `Leader` and this module is bypassed entirely by the
//! caller -- see `main.rs`).

use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::error::BridgeError;
use crate::registry::{Registry, StateRecord};
use crate::store::SharedStore;

pub const HEARTBEAT_TIMEOUT_MS: i64 = 90_000;
pub const FAILOVER_JITTER_MS: u64 = 10_000;
pub const VERIFY_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Standby,
    Leader,
}

pub struct Election {
    device_id: String,
    role: Role,
    became_active_at: Option<std::time::Instant>,
}

impl Election {
    pub fn new(device_id: String) -> Self {
        Election {
            device_id,
            role: Role::Standby,
            became_active_at: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Monotonic instant this instance last became leader, used by the
    /// ingest loop to drop updates dated before the handoff.
    pub fn became_active_at(&self) -> Option<std::time::Instant> {
        self.became_active_at
    }

    /// Runs one election tick. Any store error short-circuits to
    /// `Standby` -- election is advisory and always retries on the next
    /// tick, never retries internally.
    pub async fn tick(&mut self, store: &SharedStore, now_ms: i64) -> Role {
        match self.try_tick(store, now_ms).await {
            Ok(role) => role,
            Err(e) => {
                tracing::warn!(error = %e, "election tick failed, reverting to standby");
                self.role = Role::Standby;
                self.role
            }
        }
    }

    async fn try_tick(&mut self, store: &SharedStore, now_ms: i64) -> Result<Role, BridgeError> {
        let registry = Registry::new(store);
        let state = registry.read_state().await?;

        if state.active_device.as_deref() == Some(self.device_id.as_str()) {
            if self.role != Role::Leader {
                self.became_active_at = Some(std::time::Instant::now());
            }
            self.role = Role::Leader;
            return Ok(self.role);
        }

        let age = now_ms - state.active_device_heartbeat;
        let is_stale = state.active_device.is_none() || age > HEARTBEAT_TIMEOUT_MS;
        if !is_stale {
            self.role = Role::Standby;
            return Ok(self.role);
        }

        self.candidate(store, now_ms).await
    }

    async fn candidate(&mut self, store: &SharedStore, now_ms: i64) -> Result<Role, BridgeError> {
        let delay_ms = rand::thread_rng().gen_range(0..=FAILOVER_JITTER_MS);
        sleep(Duration::from_millis(delay_ms)).await;

        let registry = Registry::new(store);
        let pre = registry.read_state().await?;
        let age = now_ms - pre.active_device_heartbeat;
        if pre.active_device.is_some() && age <= HEARTBEAT_TIMEOUT_MS {
            self.role = Role::Standby;
            return Ok(self.role);
        }

        let prev_last_modified = pre.last_modified;
        let attempt = StateRecord {
            active_device: Some(self.device_id.clone()),
            active_device_heartbeat: now_ms,
            last_update_id: pre.last_update_id,
            last_modified: now_ms,
            modified_by: Some(self.device_id.clone()),
            foreign_chat_ids: pre.foreign_chat_ids,
        };
        registry.write_state(&attempt).await?;

        sleep(Duration::from_millis(VERIFY_DELAY_MS)).await;

        let post = registry.read_state().await?;
        let promoted =
            post.active_device.as_deref() == Some(self.device_id.as_str()) && post.last_modified >= prev_last_modified;

        if promoted {
            self.became_active_at = Some(std::time::Instant::now());
            self.role = Role::Leader;
        } else {
            self.role = Role::Standby;
        }
        Ok(self.role)
    }

    /// `/use <n|name>` bypasses the staleness check but still performs
    /// the write-then-verify of the candidation protocol's steps 3-5.
    pub async fn force_become_leader(&mut self, store: &SharedStore, now_ms: i64) -> Result<Role, BridgeError> {
        let promoted = force_activate(store, &self.device_id, now_ms).await?;
        if promoted {
            self.became_active_at = Some(std::time::Instant::now());
            self.role = Role::Leader;
        } else {
            self.role = Role::Standby;
        }
        Ok(self.role)
    }
}

/// Write-then-verify activation of an arbitrary device, bypassing the
/// staleness check of step 2 (spec §4.7 `/use <n|name>`). Unlike
/// [`Election::force_become_leader`] this doesn't require `device_name` to be
/// the caller's own id -- `/use` can hand leadership to any device listed in
/// the registry, and that device's own next election tick is what notices
/// and transitions its in-memory [`Role`].
pub async fn force_activate(store: &SharedStore, device_name: &str, now_ms: i64) -> Result<bool, BridgeError> {
    let registry = Registry::new(store);
    let pre = registry.read_state().await?;
    let prev_last_modified = pre.last_modified;
    let attempt = StateRecord {
        active_device: Some(device_name.to_string()),
        active_device_heartbeat: now_ms,
        last_update_id: pre.last_update_id,
        last_modified: now_ms,
        modified_by: Some(device_name.to_string()),
        foreign_chat_ids: pre.foreign_chat_ids,
    };
    registry.write_state(&attempt).await?;

    sleep(Duration::from_millis(VERIFY_DELAY_MS)).await;

    let post = registry.read_state().await?;
    Ok(post.active_device.as_deref() == Some(device_name) && post.last_modified >= prev_last_modified)
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
    async fn becomes_leader_when_state_is_empty() {
        let (_dir, store) = store();
        let mut election = Election::new("dev-a".into());
        let role = election.tick(&store, 1_000_000).await;
        assert_eq!(role, Role::Leader);
        assert!(election.became_active_at().is_some());
    }

    #[tokio::test]
    async fn stays_standby_when_another_device_is_fresh_leader() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_state(&StateRecord {
                active_device: Some("dev-other".into()),
                active_device_heartbeat: 1_000_000,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut election = Election::new("dev-a".into());
        let role = election.tick(&store, 1_000_100).await;
        assert_eq!(role, Role::Standby);
    }

    #[tokio::test]
    async fn recognizes_self_as_leader_from_existing_state() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_state(&StateRecord {
                active_device: Some("dev-a".into()),
                active_device_heartbeat: 1_000_000,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut election = Election::new("dev-a".into());
        let role = election.tick(&store, 1_000_100).await;
        assert_eq!(role, Role::Leader);
    }

    #[tokio::test]
    async fn takes_over_when_leader_heartbeat_is_stale() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_state(&StateRecord {
                active_device: Some("dev-dead".into()),
                active_device_heartbeat: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut election = Election::new("dev-a".into());
        let role = election.tick(&store, HEARTBEAT_TIMEOUT_MS + 1_000).await;
        assert_eq!(role, Role::Leader);
        let state = registry.read_state().await.unwrap();
        assert_eq!(state.active_device.as_deref(), Some("dev-a"));
    }

    #[tokio::test]
    async fn force_become_leader_overwrites_fresh_leader() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        registry
            .write_state(&StateRecord {
                active_device: Some("dev-other".into()),
                active_device_heartbeat: 1_000_000,
                ..Default::default()
            })
            .await
            .unwrap();
        let mut election = Election::new("dev-a".into());
        let role = election.force_become_leader(&store, 1_000_100).await.unwrap();
        assert_eq!(role, Role::Leader);
    }
}
