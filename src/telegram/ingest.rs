//! Update ingestion loop (C6), spec §4.6: long-polls (or proxy-polls) new
//! Telegram updates while leader, advances `lastUpdateId`, drives the
//! election (C3) and heartbeat (C4) timers every tick, and applies the
//! foreign-chat guard (C10) before handing surviving updates to the command
//! router (C7).
//!
//! Grounded in `ralph-telegram::daemon.rs`'s `'daemon: while !shutdown.load`
//! loop shape: one outer loop, `tokio::select!` against the shutdown flag,
//! offset advancement after every processed update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use teloxide::types::{Update, UpdateKind};

use crate::election::{self, Election, Role};
use crate::heartbeat::HeartbeatSchedule;
use crate::registry::Registry;
use crate::store::SharedStore;
use crate::telegram::router::Router;
use crate::telegram::transport::TelegramTransport;

const FOREIGN_CHAT_LOG_LIMIT: usize = 5;
const PROXY_POLL_TIMEOUT_SECS: u64 = 30;
const DIRECT_POLL_TIMEOUT_SECS: u32 = 30;
const POLL_ERROR_BACKOFF_SECS: u64 = 5;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Deserialize)]
struct ProxyEnvelope {
    #[serde(default)]
    updates: Vec<ProxyUpdate>,
}

#[derive(Deserialize)]
struct ProxyUpdate {
    update_id: i64,
    payload: Update,
}

/// Everything the ingest loop needs that isn't already owned by
/// [`Election`]/[`HeartbeatSchedule`]: identity, the configured chat/thread
/// to accept updates from, and how to reach Telegram.
pub struct IngestLoop {
    transport: Arc<TelegramTransport>,
    store: Option<Arc<SharedStore>>,
    device_id: String,
    hostname: String,
    working_dir: String,
    pid: u32,
    chat_id: i64,
    thread_id: Option<i64>,
    updates_url: Option<String>,
    startup_time_secs: i64,
    http: reqwest::Client,
}

impl IngestLoop {
    pub fn new(
        transport: Arc<TelegramTransport>,
        store: Option<Arc<SharedStore>>,
        device_id: String,
        hostname: String,
        working_dir: String,
        pid: u32,
        chat_id: i64,
        thread_id: Option<i64>,
        updates_url: Option<String>,
    ) -> Self {
        IngestLoop {
            transport,
            store,
            device_id,
            hostname,
            working_dir,
            pid,
            chat_id,
            thread_id,
            updates_url,
            startup_time_secs: now_millis() / 1000,
            http: reqwest::Client::new(),
        }
    }

    /// Runs until `shutdown` is set, which the ingest loop checks between
    /// ticks (long-polls are themselves bounded by their own timeout, so
    /// shutdown never waits longer than one poll cycle).
    pub async fn run(self, router: Arc<Router>, shutdown: Arc<AtomicBool>) {
        let sanitized_device_id = crate::device::sanitize_for_filename(&self.device_id);
        let mut election = self.store.as_ref().map(|_| Election::new(self.device_id.clone()));
        let mut schedule = HeartbeatSchedule::for_standby();
        let mut last_update_id: i64 = self.seed_last_update_id().await;
        let mut was_leader = election.is_none();
        let mut became_active_epoch: Option<i64> = None;

        while !shutdown.load(Ordering::Relaxed) {
            let now_ms = now_millis();
            let role = match (&self.store, election.as_mut()) {
                (Some(store), Some(election)) => {
                    let previous_role = election.role();
                    let new_role = election.tick(store, now_ms).await;
                    if new_role != previous_role {
                        schedule = HeartbeatSchedule::for_role(new_role);
                    }
                    self.send_due_heartbeats(store, new_role, &sanitized_device_id, &mut schedule, now_ms)
                        .await;
                    new_role
                }
                _ => Role::Leader,
            };

            if role == Role::Leader {
                if !was_leader {
                    was_leader = true;
                    became_active_epoch = Some(now_ms / 1000);
                    tracing::info!(device = %self.device_id, "became active");
                    self.announce_became_active().await;
                }
                self.poll_and_dispatch(&router, &mut last_update_id, became_active_epoch)
                    .await;
            } else {
                was_leader = false;
                let wait = schedule.standby_check.remaining();
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Posts the one-line "now ACTIVE" notification spec §4.6 step 2 and
    /// scenario 1 require, carrying a best-effort commit summary. The
    /// JJ/Git lookup itself is out of core scope (spec §1) -- this just
    /// shells out to `git log` and degrades to no summary on any failure.
    async fn announce_became_active(&self) {
        let summary = commit_summary(&self.working_dir).await;
        let text = match summary {
            Some(s) => format!("\u{1f7e2} {} is now ACTIVE ({s})", self.device_id),
            None => format!("\u{1f7e2} {} is now ACTIVE", self.device_id),
        };
        let _ = self
            .transport
            .send_message(teloxide::types::ChatId(self.chat_id), self.thread_id, &text, None, None)
            .await;
    }

    async fn seed_last_update_id(&self) -> i64 {
        let Some(store) = &self.store else { return 0 };
        let registry = Registry::new(store);
        registry.read_state().await.map(|s| s.last_update_id).unwrap_or(0)
    }

    async fn send_due_heartbeats(
        &self,
        store: &SharedStore,
        role: Role,
        sanitized_device_id: &str,
        schedule: &mut HeartbeatSchedule,
        now_ms: i64,
    ) {
        let registry = Registry::new(store);

        if schedule.device_heartbeat.fire_if_due() {
            let record = crate::registry::DeviceRecord {
                name: self.device_id.clone(),
                thread_id: self.thread_id,
                hostname: self.hostname.clone(),
                directory: self.working_dir.clone(),
                pid: self.pid,
                last_seen: now_ms,
            };
            if let Err(e) = registry.write_device(sanitized_device_id, &record).await {
                tracing::warn!(error = %e, "device heartbeat write failed");
            }
        }

        if role != Role::Leader {
            return;
        }

        if schedule.active_heartbeat.fire_if_due() {
            match registry.read_state().await {
                Ok(mut state) => {
                    state.active_device = Some(self.device_id.clone());
                    state.active_device_heartbeat = now_ms;
                    state.last_modified = now_ms;
                    state.modified_by = Some(self.device_id.clone());
                    if let Err(e) = registry.write_state(&state).await {
                        tracing::warn!(error = %e, "active heartbeat write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "active heartbeat read failed"),
            }
        }

        if schedule.stale_sweep.fire_if_due() {
            match registry.sweep_stale_devices(now_ms).await {
                Ok(removed) if removed > 0 => tracing::info!(removed, "swept stale device records"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "stale device sweep failed"),
            }
        }
    }

    async fn poll_and_dispatch(&self, router: &Arc<Router>, last_update_id: &mut i64, became_active_epoch: Option<i64>) {
        let batch = match &self.updates_url {
            Some(url) => self.poll_proxy(url, *last_update_id).await,
            None => self
                .transport
                .long_poll_updates((*last_update_id + 1) as i32, DIRECT_POLL_TIMEOUT_SECS)
                .await
                .map(|updates| updates.into_iter().map(|u| (u.id.0 as i64, u)).collect::<Vec<_>>()),
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "poll failed");
                tokio::time::sleep(std::time::Duration::from_secs(POLL_ERROR_BACKOFF_SECS)).await;
                return;
            }
        };

        let mut new_foreign_chat_seen = false;
        for (update_id, update) in batch {
            if update_id > *last_update_id {
                *last_update_id = update_id;
            }
            if self.dispatch_if_accepted(router, update, became_active_epoch).await {
                new_foreign_chat_seen = true;
            }
            self.persist_last_update_id(*last_update_id).await;
        }
        // Scenario 5: a batch carrying several updates from new foreign
        // chats gets exactly one aggregate warning, not one per id.
        if new_foreign_chat_seen {
            self.announce_foreign_chats().await;
        }
    }

    async fn poll_proxy(&self, base_url: &str, since: i64) -> Result<Vec<(i64, Update)>, crate::error::BridgeError> {
        let mut url = reqwest::Url::parse(base_url)
            .map_err(|e| crate::error::BridgeError::TelegramTransient(format!("invalid updatesUrl: {e}")))?;
        let mut user = String::new();
        let mut pass = None;
        if !url.username().is_empty() || url.password().is_some() {
            user = url.username().to_string();
            pass = url.password().map(|p| p.to_string());
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("since", &since.to_string());
            qp.append_pair("chat_id", &self.chat_id.to_string());
            if let Some(tid) = self.thread_id {
                qp.append_pair("thread_id", &tid.to_string());
            }
        }

        let mut req = self
            .http
            .get(url)
            .timeout(std::time::Duration::from_secs(PROXY_POLL_TIMEOUT_SECS));
        if !user.is_empty() || pass.is_some() {
            req = req.basic_auth(user, pass);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| crate::error::BridgeError::TelegramTransient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(crate::error::BridgeError::TelegramTransient(format!(
                "updates proxy returned HTTP {}",
                resp.status()
            )));
        }
        let envelope: ProxyEnvelope = resp
            .json()
            .await
            .map_err(|e| crate::error::BridgeError::TelegramTransient(e.to_string()))?;
        Ok(envelope.updates.into_iter().map(|u| (u.update_id, u.payload)).collect())
    }

    /// Applies the filtering spec §4.6 describes before dispatch: drop
    /// bot-authored updates, gate on the chat/thread the device is
    /// configured for (recording unseen chats for the foreign-chat guard,
    /// C10), and drop anything dated before this instance's handoff/startup.
    /// Returns `true` iff this update introduced a newly-seen foreign chat
    /// id, so the caller can aggregate one warning per poll batch (spec
    /// scenario 5) instead of one per update.
    async fn dispatch_if_accepted(&self, router: &Arc<Router>, update: Update, became_active_epoch: Option<i64>) -> bool {
        let Some(fields) = extract_fields(&update) else { return false };

        if fields.chat_id != self.chat_id {
            return self.record_foreign_chat(fields.chat_id).await;
        }
        if let Some(expected) = self.thread_id {
            if fields.thread_id != Some(expected) {
                return false;
            }
        }
        if fields.is_bot {
            return false;
        }
        let cutoff = became_active_epoch.unwrap_or(self.startup_time_secs).max(self.startup_time_secs);
        if fields.date_secs < cutoff {
            return false;
        }

        match update.kind {
            UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) => router.handle_message(msg).await,
            UpdateKind::CallbackQuery(cq) => router.handle_callback(cq).await,
            _ => {}
        }
        false
    }

    /// Spec §4.6 step 5 / §4.10: records a chat id the bot saw but isn't
    /// configured for. Returns `true` only the first time a given id is
    /// newly recorded (scenario 5: a second identical poll must neither
    /// re-record the id nor contribute to another warning) -- the
    /// aggregate warning itself is sent once per poll batch by
    /// [`Self::announce_foreign_chats`], not per update.
    async fn record_foreign_chat(&self, chat_id: i64) -> bool {
        let Some(store) = &self.store else { return false };
        let registry = Registry::new(store);
        let mut state = match registry.read_state().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read state for foreign-chat guard");
                return false;
            }
        };
        if state.foreign_chat_ids.contains(&chat_id) {
            return false;
        }
        state.foreign_chat_ids.push(chat_id);
        if let Err(e) = registry.write_state(&state).await {
            tracing::warn!(error = %e, "failed to persist foreign-chat guard state");
            return false;
        }
        tracing::warn!(chat_id, "update from unconfigured chat, dropping");
        true
    }

    /// Posts one aggregate warning listing the total foreign-chat count
    /// and the last five ids (spec §4.10, scenario 5), called at most
    /// once per poll batch regardless of how many new ids it contained.
    async fn announce_foreign_chats(&self) {
        let Some(store) = &self.store else { return };
        let registry = Registry::new(store);
        let state = match registry.read_state().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read state for foreign-chat warning");
                return;
            }
        };
        let total = state.foreign_chat_ids.len();
        let recent: Vec<i64> = state
            .foreign_chat_ids
            .iter()
            .rev()
            .take(FOREIGN_CHAT_LOG_LIMIT)
            .copied()
            .collect();
        let ids_text = recent.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let text = format!("\u{26a0} Seen {total} message(s) from unconfigured chats. Last 5: {ids_text}");
        let _ = self
            .transport
            .send_message(teloxide::types::ChatId(self.chat_id), self.thread_id, &text, None, None)
            .await;
    }

    async fn persist_last_update_id(&self, last_update_id: i64) {
        let Some(store) = &self.store else { return };
        let registry = Registry::new(store);
        match registry.read_state().await {
            Ok(mut state) => {
                if state.last_update_id < last_update_id {
                    state.last_update_id = last_update_id;
                    if let Err(e) = registry.write_state(&state).await {
                        tracing::warn!(error = %e, "failed to persist lastUpdateId");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read state before persisting lastUpdateId"),
        }
    }
}

/// Best-effort one-line commit summary for `working_dir`, used by the
/// "now ACTIVE" notification (spec §4.6 step 2). Out of core scope per
/// spec §1 ("JJ/Git commit-info lookup") -- this is the minimal `git`
/// fallback; any failure (not a git repo, `git` missing) returns `None`
/// silently rather than surfacing an error to the user.
async fn commit_summary(working_dir: &str) -> Option<String> {
    let output = tokio::process::Command::new("git")
        .args(["log", "-1", "--pretty=%h %s"])
        .current_dir(working_dir)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if summary.is_empty() {
        None
    } else {
        Some(summary)
    }
}

struct UpdateFields {
    chat_id: i64,
    thread_id: Option<i64>,
    date_secs: i64,
    is_bot: bool,
}

fn extract_fields(update: &Update) -> Option<UpdateFields> {
    match &update.kind {
        UpdateKind::Message(msg) | UpdateKind::EditedMessage(msg) => Some(UpdateFields {
            chat_id: msg.chat.id.0,
            thread_id: msg.thread_id.map(|t| t.0 .0 as i64),
            date_secs: msg.date.timestamp(),
            is_bot: msg.from().map(|u| u.is_bot).unwrap_or(false),
        }),
        UpdateKind::CallbackQuery(cq) => {
            let msg = cq.regular_message()?;
            Some(UpdateFields {
                chat_id: msg.chat.id.0,
                thread_id: msg.thread_id.map(|t| t.0 .0 as i64),
                date_secs: msg.date.timestamp(),
                is_bot: cq.from.is_bot,
            })
        }
        _ => None,
    }
}

/// Calls [`election::force_activate`] targeting an arbitrary device (spec
/// §4.7 `/use <n|name>`), re-exported here since the router is the only
/// caller outside `election.rs` itself.
pub use election::force_activate;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::transport::TelegramTransport;

    fn ingest_loop(store: Arc<SharedStore>, chat_id: i64) -> IngestLoop {
        IngestLoop::new(
            Arc::new(TelegramTransport::new("123:TEST")),
            Some(store),
            "dev".into(),
            "host".into(),
            "/work".into(),
            1,
            chat_id,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn record_foreign_chat_is_new_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStore::open(dir.path().to_path_buf()).unwrap());
        let ingest = ingest_loop(store, -1003333);

        assert!(ingest.record_foreign_chat(-1001111).await);
        assert!(!ingest.record_foreign_chat(-1001111).await);
    }

    #[tokio::test]
    async fn record_foreign_chat_batch_tracks_each_distinct_id_once() {
        // Scenario 5: a poll batch with two new foreign chat ids should
        // report both as newly-seen (so the caller warns once for the
        // batch), but a repeat of either must not re-report.
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStore::open(dir.path().to_path_buf()).unwrap());
        let ingest = ingest_loop(store, -1003333);

        let mut newly_seen = 0;
        for id in [-1001111, -1002222] {
            if ingest.record_foreign_chat(id).await {
                newly_seen += 1;
            }
        }
        assert_eq!(newly_seen, 2);

        for id in [-1001111, -1002222] {
            assert!(!ingest.record_foreign_chat(id).await);
        }
    }
}
