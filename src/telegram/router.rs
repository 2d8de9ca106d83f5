//! Command router (C7), spec §4.7: classifies each incoming message or
//! callback query and dispatches it to the agent, the bash table, or the
//! election/registry machinery.
//!
//! Grounded in the teacher's `commands::run_bot` dispatcher (one big match
//! over the first whitespace-delimited token of the message, falling
//! through to "treat it as a prompt" for anything unrecognized) and its
//! `file_ops`/`handle_shell_command` pattern for `/cap`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use teloxide::types::{CallbackQuery, Message, MediaKind, MessageKind};
use tokio::sync::Mutex;

use crate::agent::{AgentClient, PromptPart, TitleResult};
use crate::bash::{self, BashTable, TrackedProcess};
use crate::election;
use crate::registry::Registry;
use crate::session::{ModelRef, Session};
use crate::store::SharedStore;

use super::pending::{parse_permission_callback, parse_question_callback, PendingRegistry};
use super::transport::TelegramTransport;

/// Per-instance mutable state the router owns: the current session (if
/// any) and a model override staged before a session exists yet (spec
/// §4.7 `/model` ordering note).
#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    pending_model_override: Option<ModelRef>,
}

pub struct Router {
    transport: Arc<TelegramTransport>,
    agent: Arc<dyn AgentClient>,
    pending: Arc<PendingRegistry>,
    store: Option<Arc<SharedStore>>,
    bash: Arc<Mutex<BashTable>>,
    device_id: String,
    hostname: String,
    working_dir: String,
    chat_id: i64,
    thread_id: Option<i64>,
    openai_api_key: Option<String>,
    http: reqwest::Client,
    state: Mutex<SessionState>,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<TelegramTransport>,
        agent: Arc<dyn AgentClient>,
        pending: Arc<PendingRegistry>,
        store: Option<Arc<SharedStore>>,
        bash: Arc<Mutex<BashTable>>,
        device_id: String,
        hostname: String,
        working_dir: String,
        chat_id: i64,
        thread_id: Option<i64>,
        openai_api_key: Option<String>,
    ) -> Self {
        Router {
            transport,
            agent,
            pending,
            store,
            bash,
            device_id,
            hostname,
            working_dir,
            chat_id,
            thread_id,
            openai_api_key,
            http: reqwest::Client::new(),
            state: Mutex::new(SessionState::default()),
        }
    }

    async fn reply(&self, text: &str) {
        let _ = self.transport.send_message(teloxide::types::ChatId(self.chat_id), self.thread_id, text, None, None).await;
    }

    /// Classification order (spec §4.7 step 1-4): an awaited freetext
    /// answer wins first, then `x` cancels whatever's pending, then slash
    /// commands, then anything left over becomes a prompt submission.
    pub async fn handle_message(&self, msg: Message) {
        let thread_id = msg.thread_id.map(|t| t.0 .0 as i64);
        if thread_id != self.thread_id {
            return;
        }

        if let Some(text) = msg.text() {
            let trimmed = text.trim();

            if self.pending.is_awaiting_freetext(self.chat_id, self.thread_id).await {
                if self
                    .pending
                    .try_handle_freetext_answer(&self.transport, self.agent.as_ref(), self.chat_id, self.thread_id, trimmed)
                    .await
                {
                    return;
                }
            }

            if trimmed.eq_ignore_ascii_case("x") {
                self.handle_abort_or_cancel().await;
                return;
            }

            if trimmed.starts_with('/') {
                self.dispatch_command(trimmed).await;
                return;
            }

            self.submit_prompt(vec![PromptPart::Text(trimmed.to_string())]).await;
            return;
        }

        if let Some(parts) = self.collect_attachment_parts(&msg).await {
            if !parts.is_empty() {
                self.submit_prompt(parts).await;
            }
        }
    }

    async fn handle_abort_or_cancel(&self) {
        if self.pending.has_pending(self.chat_id, self.thread_id).await {
            self.pending.cancel_for_key(self.agent.as_ref(), self.chat_id, self.thread_id).await;
            self.reply("Cancelled.").await;
            return;
        }
        let session_id = { self.state.lock().await.session.as_ref().map(|s| s.id.clone()) };
        if let Some(id) = session_id {
            let _ = self.agent.abort(&id).await;
            self.reply("Aborted.").await;
        }
    }

    pub async fn handle_callback(&self, cq: CallbackQuery) {
        let data = match &cq.data {
            Some(d) => d.clone(),
            None => return,
        };

        if let Some((chat_id, thread_id, q_idx, selection)) = parse_question_callback(&data) {
            let handled = self
                .pending
                .handle_question_callback(&self.transport, self.agent.as_ref(), chat_id, thread_id, q_idx, selection)
                .await;
            self.answer_callback(&cq, handled).await;
            return;
        }
        if let Some((chat_id, thread_id, decision)) = parse_permission_callback(&data) {
            let handled = self
                .pending
                .handle_permission_callback(&self.transport, self.agent.as_ref(), chat_id, thread_id, decision)
                .await;
            self.answer_callback(&cq, handled).await;
            return;
        }
        self.transport.answer_callback(&cq.id, None, false).await;
    }

    async fn answer_callback(&self, cq: &CallbackQuery, handled: bool) {
        if handled {
            self.transport.answer_callback(&cq.id, None, false).await;
        } else {
            self.transport.answer_callback(&cq.id, Some("This has expired."), true).await;
        }
    }

    async fn dispatch_command(&self, text: &str) {
        let mut parts = text.splitn(2, char::is_whitespace);
        let verb = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("").trim();

        match verb {
            "/connect" => self.cmd_connect().await,
            "/version" => self.reply(env!("CARGO_PKG_VERSION")).await,
            "/model" => self.cmd_model(rest).await,
            "/interrupt" => self.cmd_interrupt(rest).await,
            "/plan" => self.submit_named_prompt("plan", rest).await,
            "/build" => self.submit_named_prompt("build", rest).await,
            "/review" => self.submit_named_prompt("review", rest).await,
            "/rename" => self.cmd_rename(rest).await,
            "/cap" => self.cmd_cap(rest).await,
            "/ps" => self.cmd_ps().await,
            "/dev" => self.cmd_dev().await,
            "/use" => self.cmd_use(rest).await,
            "/stop" => self.cmd_stop(rest).await,
            "/restart" => self.cmd_script("restart").await,
            "/upgrade" => self.cmd_script("upgrade").await,
            "/start" => self.cmd_start(rest).await,
            _ => {
                self.submit_prompt(vec![PromptPart::Text(text.to_string())]).await;
            }
        }
    }

    async fn cmd_connect(&self) {
        let session_id = { self.state.lock().await.session.as_ref().map(|s| s.id.clone()) };
        match session_id {
            Some(id) => self.reply(&format!("Connected to session {id}.")).await,
            None => self.reply("No active session yet -- send a message to start one.").await,
        }
    }

    async fn cmd_model(&self, rest: &str) {
        match rest {
            "" | "list" => match self.agent.list_models().await {
                Ok(models) => {
                    let listing = models.iter().map(|m| m.to_string()).collect::<Vec<_>>().join("\n");
                    self.reply(&format!("Available models:\n{listing}")).await;
                }
                Err(e) => self.reply(&format!("Failed to list models: {e}")).await,
            },
            "reset" => {
                let mut guard = self.state.lock().await;
                guard.pending_model_override = None;
                if let Some(s) = guard.session.as_mut() {
                    s.selected_model = None;
                }
                drop(guard);
                self.reply("Model reset to default.").await;
            }
            spec => match ModelRef::parse(spec) {
                Some(model_ref) => {
                    let mut guard = self.state.lock().await;
                    if let Some(s) = guard.session.as_mut() {
                        s.selected_model = Some(model_ref.clone());
                    } else {
                        guard.pending_model_override = Some(model_ref.clone());
                    }
                    drop(guard);
                    self.reply(&format!("Model set to {model_ref}.")).await;
                }
                None => self.reply("Usage: /model <provider>/<model>, /model list, or /model reset").await,
            },
        }
    }

    async fn cmd_interrupt(&self, rest: &str) {
        if rest.is_empty() {
            let session_id = { self.state.lock().await.session.as_ref().map(|s| s.id.clone()) };
            if let Some(id) = session_id {
                let _ = self.agent.abort(&id).await;
                self.reply("Interrupted.").await;
            } else {
                self.reply("No active session.").await;
            }
            return;
        }
        let Ok(pid) = rest.parse::<u32>() else {
            self.reply("Usage: /interrupt [pid]").await;
            return;
        };
        let tracked = { self.bash.lock().await.get(pid).cloned() };
        match tracked {
            Some(_) => {
                bash::kill_pid(pid);
                self.bash.lock().await.untrack(pid);
                self.reply(&format!("Sent SIGTERM to pid {pid}.")).await;
            }
            None => self.reply(&format!("No tracked process with pid {pid}.")).await,
        }
    }

    async fn submit_named_prompt(&self, label: &str, rest: &str) {
        let text = if rest.is_empty() { format!("/{label}") } else { format!("/{label} {rest}") };
        self.submit_prompt(vec![PromptPart::Text(text)]).await;
    }

    async fn cmd_rename(&self, rest: &str) {
        if rest.is_empty() {
            self.reply("Usage: /rename <title>").await;
            return;
        }
        {
            let mut guard = self.state.lock().await;
            if let Some(s) = guard.session.as_mut() {
                s.title = Some(rest.to_string());
                s.title_known = true;
            }
        }
        if let Some(tid) = self.thread_id {
            let _ = self.transport.edit_forum_topic(teloxide::types::ChatId(self.chat_id), tid, rest).await;
        }
        self.reply(&format!("Renamed to \"{rest}\".")).await;
    }

    async fn cmd_cap(&self, rest: &str) {
        if rest.is_empty() {
            self.reply("Usage: /cap <shell command>").await;
            return;
        }
        match bash::spawn_capture(rest, &self.working_dir).await {
            Ok((pid, handle)) => {
                self.bash.lock().await.track(TrackedProcess {
                    pid,
                    command: rest.to_string(),
                    chat_id: self.chat_id,
                    thread_id: self.thread_id,
                });
                self.reply(&format!("Started (pid {pid}): {rest}")).await;
                let bash_table = self.bash.clone();
                let transport = self.transport.clone();
                let chat_id = self.chat_id;
                let thread_id = self.thread_id;
                tokio::spawn(async move {
                    let output = match handle.await {
                        Ok(output) => output,
                        Err(_) => return,
                    };
                    bash_table.lock().await.untrack(pid);
                    let mut text = format!("pid {pid} finished");
                    if let Some(code) = output.exit_code {
                        text.push_str(&format!(" (exit {code})"));
                    }
                    if output.timed_out {
                        text.push_str(" -- timed out after 3 minutes");
                    }
                    if !output.stdout.trim().is_empty() {
                        text.push_str(&format!("\nstdout:\n{}", output.stdout.trim()));
                    }
                    if !output.stderr.trim().is_empty() {
                        text.push_str(&format!("\nstderr:\n{}", output.stderr.trim()));
                    }
                    let _ = transport.send_message(teloxide::types::ChatId(chat_id), thread_id, &text, None, None).await;
                });
            }
            Err(e) => self.reply(&format!("Failed to start command: {e}")).await,
        }
    }

    async fn cmd_ps(&self) {
        let list = { self.bash.lock().await.list().into_iter().cloned().collect::<Vec<_>>() };
        if list.is_empty() {
            self.reply("No tracked processes.").await;
            return;
        }
        let text = list
            .iter()
            .map(|p| format!("{}: {}", p.pid, p.command))
            .collect::<Vec<_>>()
            .join("\n");
        self.reply(&text).await;
    }

    async fn cmd_dev(&self) {
        let Some(store) = &self.store else {
            self.reply(&format!("1. {} (this device, no shared store)", self.device_id)).await;
            return;
        };
        let registry = Registry::new(store);
        let active_device = registry.read_state().await.ok().and_then(|s| s.active_device);
        match registry.list_devices(active_device.as_deref()).await {
            Ok(devices) => {
                let text = devices
                    .iter()
                    .map(|(idx, record)| {
                        let marker = if Some(record.name.as_str()) == active_device.as_deref() { " (active)" } else { "" };
                        format!("{idx}. {}{marker} -- {}", record.name, record.directory)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                self.reply(if text.is_empty() { "No known devices." } else { &text }).await;
            }
            Err(e) => self.reply(&format!("Failed to list devices: {e}")).await,
        }
    }

    /// `/use <n|name>` (spec §4.7): hands leadership to an arbitrary
    /// device by index (from the last `/dev` ordering) or exact name.
    async fn cmd_use(&self, rest: &str) {
        let Some(store) = &self.store else {
            self.reply("No shared store configured; this is always the active device.").await;
            return;
        };
        if rest.is_empty() {
            self.reply("Usage: /use <n|name>").await;
            return;
        }
        let registry = Registry::new(store);
        let active_device = registry.read_state().await.ok().and_then(|s| s.active_device);
        let Some(target) = resolve_device_ref(&registry, active_device.as_deref(), rest).await else {
            self.reply(&format!("No device matches \"{rest}\".")).await;
            return;
        };
        match election::force_activate(store, &target, now_millis()).await {
            Ok(true) => self.reply(&format!("{target} is now active.")).await,
            Ok(false) => self.reply("Activation could not be verified; it may not take effect.").await,
            Err(e) => self.reply(&format!("Failed to activate {target}: {e}")).await,
        }
    }

    /// `/stop <n|name>` (spec §4.7): kills the tracked process only if the
    /// target device shares this instance's hostname (can't signal a PID
    /// on another machine).
    async fn cmd_stop(&self, rest: &str) {
        let Some(store) = &self.store else {
            self.reply("No shared store configured.").await;
            return;
        };
        if rest.is_empty() {
            self.reply("Usage: /stop <n|name>").await;
            return;
        }
        let registry = Registry::new(store);
        let active_device = registry.read_state().await.ok().and_then(|s| s.active_device);
        let Some(target) = resolve_device_ref(&registry, active_device.as_deref(), rest).await else {
            self.reply(&format!("No device matches \"{rest}\".")).await;
            return;
        };
        let devices = match registry.list_devices(active_device.as_deref()).await {
            Ok(d) => d,
            Err(e) => {
                self.reply(&format!("Failed to read devices: {e}")).await;
                return;
            }
        };
        let Some((_, record)) = devices.into_iter().find(|(_, r)| r.name == target) else {
            self.reply(&format!("No device matches \"{rest}\".")).await;
            return;
        };
        if record.hostname != self.hostname {
            self.reply(&format!(
                "{target} runs on {}, not this host ({}) -- can't signal its process remotely.",
                record.hostname, self.hostname
            ))
            .await;
            return;
        }
        bash::kill_pid(record.pid);
        let sanitized = crate::device::sanitize_for_filename(&target);
        let _ = registry.remove_device(&sanitized).await;
        self.reply(&format!("Stopped {target} (pid {}).", record.pid)).await;
    }

    /// `/restart` and `/upgrade` (spec §4.7): best-effort, look for
    /// `scripts/<verb>.sh` under the working directory and run it if
    /// present; otherwise report there's nothing to do.
    async fn cmd_script(&self, verb: &str) {
        let script = std::path::Path::new(&self.working_dir).join("scripts").join(format!("{verb}.sh"));
        if !script.exists() {
            self.reply(&format!("No scripts/{verb}.sh found in {}.", self.working_dir)).await;
            return;
        }
        match bash::spawn_capture(&script.display().to_string(), &self.working_dir).await {
            Ok((pid, _handle)) => self.reply(&format!("Running scripts/{verb}.sh (pid {pid}).")).await,
            Err(e) => self.reply(&format!("Failed to run scripts/{verb}.sh: {e}")).await,
        }
    }

    /// `/start <dir>` (spec §4.7): spawns a sibling instance of this same
    /// binary pointed at another working directory.
    async fn cmd_start(&self, rest: &str) {
        if rest.is_empty() {
            self.reply("Usage: /start <directory>").await;
            return;
        }
        let exe = match std::env::current_exe() {
            Ok(p) => p,
            Err(e) => {
                self.reply(&format!("Failed to resolve current executable: {e}")).await;
                return;
            }
        };
        match tokio::process::Command::new(exe).arg(rest).spawn() {
            Ok(child) => {
                let pid = child.id().unwrap_or(0);
                self.reply(&format!("Started a new instance for {rest} (pid {pid}).")).await;
            }
            Err(e) => self.reply(&format!("Failed to start instance: {e}")).await,
        }
    }

    async fn submit_prompt(&self, parts: Vec<PromptPart>) {
        let (session_id, model) = {
            let guard = self.state.lock().await;
            (guard.session.as_ref().map(|s| s.id.clone()), guard.session.as_ref().and_then(|s| s.selected_model.clone()).or_else(|| guard.pending_model_override.clone()))
        };

        let first_text = parts.iter().find_map(|p| match p {
            PromptPart::Text(t) => Some(t.clone()),
            _ => None,
        });

        match self.agent.submit_prompt(session_id.as_deref(), parts, model.as_ref()).await {
            Ok(new_session_id) => {
                let is_new = session_id.as_deref() != Some(new_session_id.as_str());
                let mut guard = self.state.lock().await;
                if is_new {
                    let mut session = Session::new(new_session_id.clone());
                    session.selected_model = guard.pending_model_override.take().or(model);
                    guard.session = Some(session);
                }
                drop(guard);

                if is_new {
                    self.kick_off_title_generation(new_session_id, first_text).await;
                }
            }
            Err(e) => self.reply(&format!("Failed to submit prompt: {e}")).await,
        }
    }

    /// Spec §4.7: the first message of a new session kicks off async
    /// title generation; the reply is applied as the forum topic's name
    /// once it resolves (best-effort, using this device's configured
    /// default thread since the router has no access to the projector's
    /// per-session topic map).
    async fn kick_off_title_generation(&self, session_id: String, first_message: Option<String>) {
        let Some(first_message) = first_message else { return };
        let Some(thread_id) = self.thread_id else { return };
        match self.agent.generate_title(&session_id, &first_message).await {
            Ok(TitleResult::Title(title)) => {
                {
                    let mut guard = self.state.lock().await;
                    if let Some(s) = guard.session.as_mut() {
                        if s.id == session_id {
                            s.title = Some(title.clone());
                            s.title_known = true;
                        }
                    }
                }
                let _ = self.transport.edit_forum_topic(teloxide::types::ChatId(self.chat_id), thread_id, &title).await;
            }
            Ok(TitleResult::Unknown(_)) | Err(_) => {}
        }
    }

    /// Builds prompt parts from a message's photo/voice/document attachment
    /// (spec §4.7 step 5). Video is explicitly rejected.
    async fn collect_attachment_parts(&self, msg: &Message) -> Option<Vec<PromptPart>> {
        let MessageKind::Common(common) = &msg.kind else { return None };
        match &common.media_kind {
            MediaKind::Photo(photo) => {
                let file_id = photo.photo.last()?.file.id.clone();
                let part = self.download_as_data_url(&file_id, "image/jpeg", "photo.jpg").await?;
                Some(vec![part])
            }
            MediaKind::Voice(voice) => {
                let Some(api_key) = &self.openai_api_key else {
                    self.reply("Voice messages need OPENAI_API_KEY configured for transcription.").await;
                    return None;
                };
                let url = self.transport.get_file_download_url(&voice.voice.file.id).await.ok()?;
                let bytes = self.http.get(&url).send().await.ok()?.bytes().await.ok()?;
                match transcribe_voice(&self.http, api_key, bytes.to_vec()).await {
                    Some(text) => Some(vec![PromptPart::Text(text)]),
                    None => {
                        self.reply("Voice transcription failed.").await;
                        None
                    }
                }
            }
            MediaKind::Video(_) => {
                self.reply("Video attachments aren't supported.").await;
                None
            }
            MediaKind::Document(doc) => {
                let mime = doc.document.mime_type.as_ref().map(|m| m.to_string()).unwrap_or_else(|| "application/octet-stream".into());
                let name = doc.document.file_name.clone().unwrap_or_else(|| "file".into());
                let part = self.download_as_data_url(&doc.document.file.id, &mime, &name).await?;
                Some(vec![part])
            }
            _ => None,
        }
    }

    async fn download_as_data_url(&self, file_id: &str, mime: &str, name: &str) -> Option<PromptPart> {
        let url = self.transport.get_file_download_url(file_id).await.ok()?;
        let bytes = self.http.get(&url).send().await.ok()?.bytes().await.ok()?;
        let encoded = BASE64.encode(&bytes);
        Some(PromptPart::DataUrlFile {
            mime: mime.to_string(),
            data_url: format!("data:{mime};base64,{encoded}"),
            name: name.to_string(),
        })
    }
}

/// Resolves `/use`/`/stop`'s `<n|name>` argument against the last `/dev`
/// ordering (1-based index) or an exact device name.
async fn resolve_device_ref(registry: &Registry<'_>, active_device: Option<&str>, reference: &str) -> Option<String> {
    let devices = registry.list_devices(active_device).await.ok()?;
    if let Ok(idx) = reference.parse::<usize>() {
        return devices.into_iter().find(|(i, _)| *i == idx).map(|(_, r)| r.name);
    }
    devices.into_iter().find(|(_, r)| r.name == reference).map(|(_, r)| r.name)
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRecord;
    use crate::store::SharedStore;

    fn store() -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    async fn seed(registry: &Registry<'_>, name: &str, last_seen: i64) {
        registry
            .write_device(
                name,
                &DeviceRecord {
                    name: name.to_string(),
                    thread_id: None,
                    hostname: "h".into(),
                    directory: "/x".into(),
                    pid: 1,
                    last_seen,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn resolve_device_ref_by_index_follows_dev_ordering() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        seed(&registry, "dev-a", 100).await;
        seed(&registry, "dev-b", 200).await;
        // dev-b has the more recent heartbeat, so with no active device it
        // sorts first and "/use 1" should resolve to it.
        let target = resolve_device_ref(&registry, None, "1").await;
        assert_eq!(target.as_deref(), Some("dev-b"));
    }

    #[tokio::test]
    async fn resolve_device_ref_by_exact_name() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        seed(&registry, "dev-a", 100).await;
        let target = resolve_device_ref(&registry, None, "dev-a").await;
        assert_eq!(target.as_deref(), Some("dev-a"));
    }

    #[tokio::test]
    async fn resolve_device_ref_unknown_reference_is_none() {
        let (_dir, store) = store();
        let registry = Registry::new(&store);
        seed(&registry, "dev-a", 100).await;
        assert!(resolve_device_ref(&registry, None, "nope").await.is_none());
        assert!(resolve_device_ref(&registry, None, "99").await.is_none());
    }
}

/// Uploads `audio` to OpenAI's Whisper transcription endpoint (spec §4.7
/// voice-message handling). Best-effort: any failure returns `None` and
/// the caller reports it to the user.
async fn transcribe_voice(http: &reqwest::Client, api_key: &str, audio: Vec<u8>) -> Option<String> {
    let part = reqwest::multipart::Part::bytes(audio).file_name("voice.ogg").mime_str("audio/ogg").ok()?;
    let form = reqwest::multipart::Form::new().part("file", part).text("model", "whisper-1");
    let resp = http
        .post("https://api.openai.com/v1/audio/transcriptions")
        .bearer_auth(api_key)
        .multipart(form)
        .send()
        .await
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: serde_json::Value = resp.json().await.ok()?;
    body.get("text").and_then(|v| v.as_str()).map(|s| s.to_string())
}
