//! Streaming projector (C8), spec §4.8: turns the agent's event stream into
//! Telegram messages. The teacher's `streaming.rs` does one coarse edit per
//! 3-second tick off a shared rate limiter (`shared_rate_limit_wait`); this
//! generalizes that into the per-`(sessionId, messageId, partKind)` debounce
//! state machine spec §4.8.1/§4.8.2 require, reusing the teacher's
//! `format_tool_input` tool-summary idea for the `tool`/`step-finish`
//! handling and its `markdown_to_telegram_html` "degrade on failure" idea
//! as the `markdown_ok` flag on [`crate::session::ThrottledMessage`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::sync::Mutex;

use crate::agent::events::{AgentEvent, Part, SessionStatusKind, ToolStatus};
use crate::agent::AgentClient;
use crate::session::{QuestionPrompt, StreamState, ThrottledMessage};

use super::format::{best_split_point, escape_markdown_v2, format_reasoning, format_todo_list, TELEGRAM_MSG_LIMIT};
use super::pending::PendingRegistry;
use super::transport::{TelegramTransport, TypingHandle};

const TEXT_MIN_LEN: usize = 10;
const TEXT_FLOOR: Duration = Duration::from_secs(2);
const TEXT_DEBOUNCE: Duration = Duration::from_secs(2);
const REASONING_FLOOR: Duration = Duration::from_secs(2);
const REASONING_DEBOUNCE: Duration = Duration::from_millis(2500);
const TYPING_IDLE_INTERVAL: Duration = Duration::from_millis(2500);
const TYPING_TOOL_INTERVAL: Duration = Duration::from_millis(1500);
const TOOL_INACTIVITY_RELEASE: Duration = Duration::from_secs(12);
const EARLY_FLUSH_RATIO: f64 = 0.9;

/// `now - lastEdit >= floor` (spec §4.8.1 step 3 / §4.8.2): whether an edit
/// may happen immediately rather than being debounced.
fn due_for_edit(last_edit: Option<Instant>, now: Instant, floor: Duration) -> bool {
    match last_edit {
        None => true,
        Some(t) => now.saturating_duration_since(t) >= floor,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypingMode {
    Idle,
    Tool,
}

struct MessageRuntime {
    stream: StreamState,
}

impl MessageRuntime {
    fn new() -> Self {
        MessageRuntime { stream: StreamState::default() }
    }
}

struct SessionRuntime {
    thread_id: Option<i64>,
    registered: HashSet<String>,
    buffered: HashMap<String, Vec<Part>>,
    messages: HashMap<String, MessageRuntime>,
    typing: Option<TypingHandle>,
    typing_mode: TypingMode,
    last_tool_activity: Option<Instant>,
    /// Bumped on every delta; a scheduled debounce task only acts if its
    /// captured generation still matches when it wakes, which is how
    /// "each new update replaces the pending debounce" (spec §4.8.1 step 3)
    /// is implemented without cancelling the sleeping task directly.
    text_generation: HashMap<String, u64>,
    reasoning_generation: HashMap<String, u64>,
}

impl SessionRuntime {
    fn new(thread_id: Option<i64>) -> Self {
        SessionRuntime {
            thread_id,
            registered: HashSet::new(),
            buffered: HashMap::new(),
            messages: HashMap::new(),
            typing: None,
            typing_mode: TypingMode::Idle,
            last_tool_activity: None,
            text_generation: HashMap::new(),
            reasoning_generation: HashMap::new(),
        }
    }
}

/// Drives Telegram output from an [`AgentClient`]'s event stream (spec
/// §4.8). One instance per bridge process; internally keyed by session id
/// since a single Telegram chat/topic can host several agent sessions over
/// its lifetime (one topic per session, per `session.created`).
pub struct StreamingProjector {
    transport: Arc<TelegramTransport>,
    agent: Arc<dyn AgentClient>,
    pending: Arc<PendingRegistry>,
    chat_id: i64,
    default_thread_id: Option<i64>,
    diff_viewer_url: Option<String>,
    http: reqwest::Client,
    sessions: Arc<Mutex<HashMap<String, SessionRuntime>>>,
}

impl StreamingProjector {
    pub fn new(
        transport: Arc<TelegramTransport>,
        agent: Arc<dyn AgentClient>,
        pending: Arc<PendingRegistry>,
        chat_id: i64,
        default_thread_id: Option<i64>,
        diff_viewer_url: Option<String>,
    ) -> Self {
        StreamingProjector {
            transport,
            agent,
            pending,
            chat_id,
            default_thread_id,
            diff_viewer_url,
            http: reqwest::Client::new(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Runs forever, consuming `rx` until the channel closes (agent
    /// process exited). Intended to be spawned as the event-consumer loop
    /// of spec §5.
    pub async fn run(&self, mut rx: tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&self, event: AgentEvent) {
        match event {
            AgentEvent::SessionStatus { session_id, status, detail } => {
                self.on_session_status(&session_id, status, detail).await
            }
            AgentEvent::SessionCreated { session_id } => self.on_session_created(&session_id).await,
            AgentEvent::SessionIdle { session_id } => self.on_session_idle(&session_id).await,
            AgentEvent::SessionError { session_id, message, aborted } => {
                self.on_session_error(&session_id, &message, aborted).await
            }
            AgentEvent::SessionDiff { .. } => {}
            AgentEvent::MessageUpdated { session_id, message_id, role } => {
                if role == crate::agent::events::MessageRole::Assistant {
                    self.on_message_registered(&session_id, &message_id).await;
                }
            }
            AgentEvent::MessagePartUpdated { session_id, message_id, part } => {
                self.on_part_updated(&session_id, &message_id, part).await;
            }
            AgentEvent::QuestionAsked { request_id, chat_id, thread_id, questions } => {
                let prompts = questions
                    .into_iter()
                    .map(|q| QuestionPrompt { text: q.text, options: q.options })
                    .collect();
                self.pending
                    .open_question(&self.transport, self.agent.as_ref(), request_id, chat_id, thread_id, prompts)
                    .await;
            }
            AgentEvent::PermissionAsked { request_id, chat_id, thread_id, permission, patterns } => {
                self.pending
                    .open_permission(&self.transport, self.agent.as_ref(), request_id, chat_id, thread_id, permission, patterns)
                    .await;
            }
            AgentEvent::Unknown { kind, payload } => {
                tracing::warn!(kind = %kind, "unrecognized agent event");
                let dump = format!("```\ntype: {kind}\n{}\n```", serde_json::to_string_pretty(&payload).unwrap_or_default());
                let _ = self
                    .transport
                    .send_message(ChatId(self.chat_id), self.default_thread_id, &dump, None, None)
                    .await;
            }
        }
    }

    async fn thread_for(&self, sessions: &HashMap<String, SessionRuntime>, session_id: &str) -> Option<i64> {
        sessions.get(session_id).and_then(|s| s.thread_id).or(self.default_thread_id)
    }

    async fn on_session_status(&self, session_id: &str, status: SessionStatusKind, detail: Option<String>) {
        match status {
            SessionStatusKind::Busy => self.set_typing_mode(session_id, TypingMode::Idle).await,
            SessionStatusKind::Idle => self.stop_typing(session_id).await,
            SessionStatusKind::Retry | SessionStatusKind::Error => {
                let thread_id = {
                    let sessions = self.sessions.lock().await;
                    self.thread_for(&sessions, session_id).await
                };
                let text = detail.unwrap_or_else(|| format!("{status:?}"));
                let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &text, None, None).await;
            }
        }
    }

    async fn on_session_created(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return;
        }
        drop(sessions);

        let thread_id = match self
            .transport
            .create_forum_topic(ChatId(self.chat_id), &format!("session {session_id}"))
            .await
        {
            Ok(tid) => Some(tid),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create forum topic, falling back to default thread");
                self.default_thread_id
            }
        };

        sessions = self.sessions.lock().await;
        sessions.insert(session_id.to_string(), SessionRuntime::new(thread_id));
    }

    async fn on_session_idle(&self, session_id: &str) {
        self.stop_typing(session_id).await;
        self.flush_all_text(session_id).await;

        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.get_mut(session_id) {
            s.messages.clear();
            s.buffered.clear();
            s.registered.clear();
        }
    }

    async fn on_session_error(&self, session_id: &str, message: &str, aborted: bool) {
        self.stop_typing(session_id).await;
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };
        let text = if aborted || message.to_lowercase().contains("aborted") {
            "Interrupted.".to_string()
        } else {
            let truncated: String = message.chars().take(500).collect();
            format!("Error: {truncated}")
        };
        let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &text, None, None).await;
    }

    async fn on_message_registered(&self, session_id: &str, message_id: &str) {
        let buffered = {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRuntime::new(self.default_thread_id));
            s.registered.insert(message_id.to_string());
            s.messages.entry(message_id.to_string()).or_insert_with(MessageRuntime::new);
            s.buffered.remove(message_id).unwrap_or_default()
        };
        for part in buffered {
            self.on_part_updated(session_id, message_id, part).await;
        }
    }

    async fn on_part_updated(&self, session_id: &str, message_id: &str, part: Part) {
        let registered = {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRuntime::new(self.default_thread_id));
            s.registered.contains(message_id)
        };
        if !registered {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.get_mut(session_id).expect("just inserted above");
            s.buffered.entry(message_id.to_string()).or_default().push(part);
            return;
        }

        match part {
            Part::Text { content, .. } => self.on_text_delta(session_id, message_id, content).await,
            Part::Reasoning { content, .. } => self.on_reasoning_delta(session_id, message_id, content).await,
            Part::Tool { id, name, input, status } => {
                self.on_tool_part(session_id, message_id, &id, &name, &input, status).await
            }
            Part::StepStart { .. } => {
                self.set_typing_mode(session_id, TypingMode::Tool).await;
            }
            Part::StepFinish { .. } => {
                self.flush_message(session_id, message_id).await;
                self.set_typing_mode(session_id, TypingMode::Idle).await;
            }
            Part::Patch { .. } => {}
            Part::TodoWrite { id, items } => {
                if self.already_sent(session_id, message_id, &id).await {
                    return;
                }
                let thread_id = {
                    let sessions = self.sessions.lock().await;
                    self.thread_for(&sessions, session_id).await
                };
                let rendered = format_todo_list(&items);
                let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &rendered, None, None).await;
                self.mark_sent(session_id, message_id, &id).await;
            }
            Part::Other { id, kind, payload } => {
                if self.already_sent(session_id, message_id, &id).await {
                    return;
                }
                let thread_id = {
                    let sessions = self.sessions.lock().await;
                    self.thread_for(&sessions, session_id).await
                };
                let dump = format!("```\nkind: {kind}\n{}\n```", serde_json::to_string_pretty(&payload).unwrap_or_default());
                let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &dump, None, None).await;
                self.mark_sent(session_id, message_id, &id).await;
            }
        }
    }

    async fn already_sent(&self, session_id: &str, message_id: &str, part_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .and_then(|s| s.messages.get(message_id))
            .map(|m| m.stream.sent_part_ids.contains(part_id))
            .unwrap_or(false)
    }

    async fn mark_sent(&self, session_id: &str, message_id: &str, part_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
            m.stream.sent_part_ids.insert(part_id.to_string());
        }
    }

    /// §4.8.1: the text channel for one assistant message. `content` is
    /// the full cumulative text of the part so far; only the tail beyond
    /// `sent_prefix_len` (whatever hasn't already been finalized into a
    /// prior, no-longer-edited message by [`Self::split_overflow`]) is
    /// still live for throttled edits.
    async fn on_text_delta(&self, session_id: &str, message_id: &str, content: String) {
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };

        let too_short = {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.get_mut(session_id).expect("on_part_updated ensures session exists");
            let m = s.messages.get_mut(message_id).expect("registered message must have runtime state");
            let slot = m.stream.text.get_or_insert_with(ThrottledMessage::default);
            slot.content = content;
            let tail_start = slot.sent_prefix_len.min(slot.content.len());
            slot.content[tail_start..].chars().count() <= TEXT_MIN_LEN
        };
        if too_short {
            return;
        }

        // §4.8.1 step 6: once the unsent tail crosses EARLY_FLUSH_RATIO of
        // the Telegram limit, split at the best boundary, finalize the
        // first half into its own message, and keep only the remainder
        // live -- rather than continuing to (invalidly) edit a message
        // past Telegram's length limit.
        self.split_overflow(session_id, message_id, thread_id, EARLY_FLUSH_RATIO).await;

        enum Action {
            Send,
            EditNow(i32),
            Schedule(Instant, u64),
        }

        let (action, tail, markdown_ok) = {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.get_mut(session_id).expect("on_part_updated ensures session exists");
            let gen = s.text_generation.entry(message_id.to_string()).or_insert(0);
            *gen += 1;
            let generation = *gen;
            let m = s.messages.get_mut(message_id).expect("registered message must have runtime state");
            let slot = m.stream.text.as_mut().expect("populated above");
            let tail_start = slot.sent_prefix_len.min(slot.content.len());
            let tail = slot.content[tail_start..].to_string();
            let action = if slot.message_id.is_none() {
                Action::Send
            } else if due_for_edit(slot.last_edit, Instant::now(), TEXT_FLOOR) {
                Action::EditNow(slot.message_id.expect("checked above"))
            } else {
                let due_at = slot.last_edit.unwrap_or_else(Instant::now) + TEXT_DEBOUNCE;
                Action::Schedule(due_at, generation)
            };
            (action, tail, slot.markdown_ok)
        };

        match action {
            Action::Send => self.send_and_record_text(session_id, message_id, &tail, thread_id, markdown_ok).await,
            Action::EditNow(mid) => self.edit_and_record_text(session_id, message_id, mid, &tail, markdown_ok).await,
            Action::Schedule(due_at, generation) => {
                let sessions = self.sessions.clone();
                let transport = self.transport.clone();
                let chat_id = self.chat_id;
                let session_id = session_id.to_string();
                let message_id = message_id.to_string();
                tokio::spawn(async move {
                    let now = Instant::now();
                    if due_at > now {
                        tokio::time::sleep(due_at - now).await;
                    }
                    let (mid, rendered) = {
                        let mut guard = sessions.lock().await;
                        let Some(s) = guard.get_mut(&session_id) else { return };
                        if s.text_generation.get(&message_id).copied() != Some(generation) {
                            return;
                        }
                        let Some(m) = s.messages.get_mut(&message_id) else { return };
                        let Some(slot) = m.stream.text.as_mut() else { return };
                        let Some(mid) = slot.message_id else { return };
                        slot.last_edit = Some(Instant::now());
                        let tail_start = slot.sent_prefix_len.min(slot.content.len());
                        let tail = slot.content[tail_start..].to_string();
                        let rendered = if slot.markdown_ok { escape_markdown_v2(&tail) } else { tail };
                        (mid, rendered)
                    };
                    if let Ok(result) = transport
                        .edit_message(ChatId(chat_id), teloxide::types::MessageId(mid), &rendered, None)
                        .await
                    {
                        let mut guard = sessions.lock().await;
                        if let Some(slot) = guard.get_mut(&session_id).and_then(|s| s.messages.get_mut(&message_id)).and_then(|m| m.stream.text.as_mut()) {
                            slot.markdown_ok = result.used_markdown;
                        }
                    }
                });
            }
        }
    }

    /// Spec §4.8.1 step 6: while the unsent tail of `message_id`'s text
    /// exceeds `ratio` of the Telegram message limit, splits off a chunk
    /// at the best boundary (`best_split_point`), finalizes it into its
    /// own Telegram message (editing the current one in place if it has
    /// one, else sending a new one), and advances `sent_prefix_len` past
    /// it so only the remainder stays live for further throttled edits.
    /// Used both as the mid-stream early flush (`ratio =
    /// EARLY_FLUSH_RATIO`) and as the hard boundary `flush_message` enforces
    /// before its final edit (`ratio = 1.0`), so a step-finish edit never
    /// exceeds Telegram's length limit (spec §8 law L3).
    async fn split_overflow(&self, session_id: &str, message_id: &str, thread_id: Option<i64>, ratio: f64) {
        loop {
            let (existing_message_id, head, markdown_ok) = {
                let mut sessions = self.sessions.lock().await;
                let Some(slot) = sessions
                    .get_mut(session_id)
                    .and_then(|s| s.messages.get_mut(message_id))
                    .and_then(|m| m.stream.text.as_mut())
                else {
                    return;
                };
                let tail_start = slot.sent_prefix_len.min(slot.content.len());
                let tail = &slot.content[tail_start..];
                if (tail.len() as f64) < ratio * TELEGRAM_MSG_LIMIT as f64 {
                    return;
                }
                let split = best_split_point(tail, TELEGRAM_MSG_LIMIT);
                if split == 0 || split >= tail.len() {
                    return;
                }
                (slot.message_id, tail[..split].to_string(), slot.markdown_ok)
            };

            let rendered_head = if markdown_ok { escape_markdown_v2(&head) } else { head.clone() };
            let head_markdown_ok = match existing_message_id {
                Some(mid) => match self
                    .transport
                    .edit_message(ChatId(self.chat_id), teloxide::types::MessageId(mid), &rendered_head, None)
                    .await
                {
                    Ok(result) => result.used_markdown,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to finalize overflowed text chunk");
                        false
                    }
                },
                None => match self
                    .transport
                    .send_message(ChatId(self.chat_id), thread_id, &rendered_head, None, None)
                    .await
                {
                    Ok(sent) => sent.used_markdown,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to send overflowed text chunk");
                        markdown_ok
                    }
                },
            };

            let mut sessions = self.sessions.lock().await;
            if let Some(slot) = sessions
                .get_mut(session_id)
                .and_then(|s| s.messages.get_mut(message_id))
                .and_then(|m| m.stream.text.as_mut())
            {
                slot.sent_prefix_len += head.len();
                slot.message_id = None;
                slot.last_edit = None;
                slot.markdown_ok = head_markdown_ok;
            }
        }
    }

    async fn send_and_record_text(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        thread_id: Option<i64>,
        markdown_ok: bool,
    ) {
        let rendered = if markdown_ok { escape_markdown_v2(content) } else { content.to_string() };
        match self.transport.send_message(ChatId(self.chat_id), thread_id, &rendered, None, None).await {
            Ok(sent) => {
                let mut sessions = self.sessions.lock().await;
                if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                    if let Some(slot) = m.stream.text.as_mut() {
                        slot.message_id = Some(sent.message_id);
                        slot.last_edit = Some(Instant::now());
                        slot.markdown_ok = sent.used_markdown;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to send streamed text"),
        }
    }

    async fn edit_and_record_text(
        &self,
        session_id: &str,
        message_id: &str,
        telegram_message_id: i32,
        content: &str,
        markdown_ok: bool,
    ) {
        let rendered = if markdown_ok { escape_markdown_v2(content) } else { content.to_string() };
        match self
            .transport
            .edit_message(ChatId(self.chat_id), teloxide::types::MessageId(telegram_message_id), &rendered, None)
            .await
        {
            Ok(result) => {
                let mut sessions = self.sessions.lock().await;
                if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                    if let Some(slot) = m.stream.text.as_mut() {
                        slot.last_edit = Some(Instant::now());
                        slot.markdown_ok = result.used_markdown;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "text edit failed, degrading to plain text");
                let mut sessions = self.sessions.lock().await;
                if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                    if let Some(slot) = m.stream.text.as_mut() {
                        slot.markdown_ok = false;
                    }
                }
            }
        }
    }

    /// §4.8.2: reasoning uses the same floor/debounce shape with different
    /// constants and the `format_reasoning` short/elided rendering.
    async fn on_reasoning_delta(&self, session_id: &str, message_id: &str, content: String) {
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };
        let rendered = format_reasoning(&content);

        enum Action {
            Send,
            EditNow(i32),
            Schedule(Instant, u64),
        }

        let action = {
            let mut sessions = self.sessions.lock().await;
            let s = sessions.get_mut(session_id).expect("on_part_updated ensures session exists");
            let gen = s.reasoning_generation.entry(message_id.to_string()).or_insert(0);
            *gen += 1;
            let generation = *gen;
            let m = s.messages.get_mut(message_id).expect("registered message must have runtime state");
            let slot = m.stream.reasoning.get_or_insert_with(ThrottledMessage::default);
            slot.content = content;
            if slot.message_id.is_none() {
                Action::Send
            } else if due_for_edit(slot.last_edit, Instant::now(), REASONING_FLOOR) {
                Action::EditNow(slot.message_id.expect("checked above"))
            } else {
                let due_at = slot.last_edit.unwrap_or_else(Instant::now) + REASONING_DEBOUNCE;
                Action::Schedule(due_at, generation)
            }
        };

        match action {
            Action::Send => {
                if let Ok(sent) = self.transport.send_message(ChatId(self.chat_id), thread_id, &rendered, None, None).await {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                        if let Some(slot) = m.stream.reasoning.as_mut() {
                            slot.message_id = Some(sent.message_id);
                            slot.last_edit = Some(Instant::now());
                        }
                    }
                }
            }
            Action::EditNow(mid) => {
                let _ = self
                    .transport
                    .edit_message(ChatId(self.chat_id), teloxide::types::MessageId(mid), &rendered, None)
                    .await;
                let mut sessions = self.sessions.lock().await;
                if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                    if let Some(slot) = m.stream.reasoning.as_mut() {
                        slot.last_edit = Some(Instant::now());
                    }
                }
            }
            Action::Schedule(due_at, generation) => {
                let sessions = self.sessions.clone();
                let transport = self.transport.clone();
                let chat_id = self.chat_id;
                let session_id = session_id.to_string();
                let message_id = message_id.to_string();
                tokio::spawn(async move {
                    let now = Instant::now();
                    if due_at > now {
                        tokio::time::sleep(due_at - now).await;
                    }
                    let (mid, rendered) = {
                        let mut guard = sessions.lock().await;
                        let Some(s) = guard.get_mut(&session_id) else { return };
                        if s.reasoning_generation.get(&message_id).copied() != Some(generation) {
                            return;
                        }
                        let Some(m) = s.messages.get_mut(&message_id) else { return };
                        let Some(slot) = m.stream.reasoning.as_mut() else { return };
                        let Some(mid) = slot.message_id else { return };
                        slot.last_edit = Some(Instant::now());
                        (mid, format_reasoning(&slot.content))
                    };
                    let _ = transport.edit_message(ChatId(chat_id), teloxide::types::MessageId(mid), &rendered, None).await;
                });
            }
        }
    }

    /// `tool` running (not an in-place-edit tool) emits a one-line summary
    /// immediately; `edit`/`write` tools wait for `step-finish` to show a
    /// diff preview instead (spec §4.8).
    async fn on_tool_part(&self, session_id: &str, message_id: &str, part_id: &str, name: &str, input: &str, status: ToolStatus) {
        self.bump_tool_activity(session_id).await;
        let is_edit_tool = matches!(name, "edit" | "write");
        if is_edit_tool {
            if status == ToolStatus::Completed {
                self.send_diff_preview(session_id, message_id, part_id, name, input).await;
            }
            return;
        }
        if status != ToolStatus::Running || self.already_sent(session_id, message_id, part_id).await {
            return;
        }
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };
        let summary = format_tool_summary(name, input);
        let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &summary, None, None).await;
        self.mark_sent(session_id, message_id, part_id).await;
    }

    async fn send_diff_preview(&self, session_id: &str, message_id: &str, part_id: &str, name: &str, input: &str) {
        if self.already_sent(session_id, message_id, part_id).await {
            return;
        }
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };
        let preview = diff_preview(input, 8);
        let text = format!("{name}:\n```\n{preview}\n```");
        let markup = self.upload_diff(input).await.and_then(|url| url.parse().ok()).map(|url| {
            InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::url("View Diff", url)]])
        });
        let _ = self.transport.send_message(ChatId(self.chat_id), thread_id, &text, markup, None).await;
        self.mark_sent(session_id, message_id, part_id).await;
    }

    /// Best-effort upload of the full diff to the configured external
    /// viewer. Returns `None` (no button, silent degrade per spec §7) on
    /// any failure or when no `diff_viewer_url` is configured.
    async fn upload_diff(&self, diff_text: &str) -> Option<String> {
        let base = self.diff_viewer_url.as_ref()?;
        let resp = self
            .http
            .post(base)
            .json(&serde_json::json!({ "diff": diff_text }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("url").and_then(|v| v.as_str()).map(|s| s.to_string())
    }

    async fn flush_message(&self, session_id: &str, message_id: &str) {
        let thread_id = {
            let sessions = self.sessions.lock().await;
            self.thread_for(&sessions, session_id).await
        };

        // Hard boundary: make sure no unsent tail can still exceed the
        // Telegram limit before the final edit (spec §4.8.1 step 6, law
        // L3 "the final edit at step-finish always carries the complete
        // content").
        self.split_overflow(session_id, message_id, thread_id, 1.0).await;

        let (final_text, telegram_message_id) = {
            let sessions = self.sessions.lock().await;
            let m = sessions.get(session_id).and_then(|s| s.messages.get(message_id));
            let slot = m.and_then(|m| m.stream.text.as_ref());
            let tail = slot.map(|s| {
                let start = s.sent_prefix_len.min(s.content.len());
                s.content[start..].to_string()
            });
            (tail, slot.and_then(|s| s.message_id))
        };
        let Some(text) = final_text else { return };
        match telegram_message_id {
            Some(mid) => {
                let _ = self.transport.edit_message(ChatId(self.chat_id), teloxide::types::MessageId(mid), &text, None).await;
            }
            None if !text.is_empty() => {
                if let Ok(sent) = self.transport.send_message(ChatId(self.chat_id), thread_id, &text, None, None).await {
                    let mut sessions = self.sessions.lock().await;
                    if let Some(m) = sessions.get_mut(session_id).and_then(|s| s.messages.get_mut(message_id)) {
                        if let Some(slot) = m.stream.text.as_mut() {
                            slot.message_id = Some(sent.message_id);
                        }
                    }
                }
            }
            None => {}
        }
    }

    async fn flush_all_text(&self, session_id: &str) {
        let message_ids: Vec<String> = {
            let sessions = self.sessions.lock().await;
            sessions.get(session_id).map(|s| s.messages.keys().cloned().collect()).unwrap_or_default()
        };
        for mid in message_ids {
            self.flush_message(session_id, &mid).await;
        }
    }

    async fn set_typing_mode(&self, session_id: &str, mode: TypingMode) {
        let (thread_id, already) = {
            let sessions = self.sessions.lock().await;
            let thread_id = self.thread_for(&sessions, session_id).await;
            let already = sessions.get(session_id).map(|s| s.typing_mode == mode && s.typing.is_some()).unwrap_or(false);
            (thread_id, already)
        };
        if already {
            if mode == TypingMode::Tool {
                self.bump_tool_activity(session_id).await;
            }
            return;
        }
        let interval = match mode {
            TypingMode::Idle => TYPING_IDLE_INTERVAL,
            TypingMode::Tool => TYPING_TOOL_INTERVAL,
        };
        let handle = self.transport.start_typing(ChatId(self.chat_id), thread_id, interval);

        let mut sessions = self.sessions.lock().await;
        let s = sessions.entry(session_id.to_string()).or_insert_with(|| SessionRuntime::new(self.default_thread_id));
        s.typing = Some(handle);
        s.typing_mode = mode;
        if mode == TypingMode::Tool {
            s.last_tool_activity = Some(Instant::now());
        }
    }

    async fn bump_tool_activity(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.get_mut(session_id) {
            s.last_tool_activity = Some(Instant::now());
        }
    }

    async fn stop_typing(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(s) = sessions.get_mut(session_id) {
            s.typing = None;
        }
    }

    /// Releases a stale tool-mode typing handle after
    /// [`TOOL_INACTIVITY_RELEASE`] of no tool activity (spec §4.8.3). Meant
    /// to be called periodically (e.g. from the heartbeat scheduler tick).
    pub async fn sweep_idle_typing(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        for s in sessions.values_mut() {
            if s.typing_mode == TypingMode::Tool {
                if let Some(last) = s.last_tool_activity {
                    if now.saturating_duration_since(last) >= TOOL_INACTIVITY_RELEASE {
                        s.typing = None;
                        s.typing_mode = TypingMode::Idle;
                    }
                }
            }
        }
    }
}

/// Generalizes the teacher's `format_tool_input`: a short, present-tense
/// summary line for a running tool call.
fn format_tool_summary(name: &str, input: &str) -> String {
    let trimmed: String = input.chars().take(120).collect();
    if trimmed.is_empty() {
        format!("\u{25b6} {name}")
    } else {
        format!("\u{25b6} {name}: {trimmed}")
    }
}

/// Builds an inline diff preview capped at `max_lines` (spec §4.8: "≤8 diff
/// lines"), truncating with a line count footer when more exist.
fn diff_preview(input: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = input.lines().collect();
    if lines.len() <= max_lines {
        return input.to_string();
    }
    let head = lines[..max_lines].join("\n");
    format!("{head}\n… ({} more lines)", lines.len() - max_lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_for_edit_is_true_with_no_prior_edit() {
        assert!(due_for_edit(None, Instant::now(), TEXT_FLOOR));
    }

    #[test]
    fn due_for_edit_is_false_just_after_an_edit() {
        let now = Instant::now();
        assert!(!due_for_edit(Some(now), now, TEXT_FLOOR));
    }

    #[test]
    fn due_for_edit_is_true_after_floor_elapses() {
        let last = Instant::now() - Duration::from_secs(3);
        assert!(due_for_edit(Some(last), Instant::now(), TEXT_FLOOR));
    }

    #[test]
    fn diff_preview_passes_through_short_diffs() {
        let input = "line1\nline2";
        assert_eq!(diff_preview(input, 8), input);
    }

    #[test]
    fn diff_preview_truncates_long_diffs_to_max_lines() {
        let input = (0..20).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let preview = diff_preview(&input, 8);
        assert!(preview.contains("line0"));
        assert!(preview.contains("line7"));
        assert!(!preview.contains("line8"));
        assert!(preview.contains("12 more lines"));
    }

    #[test]
    fn tool_summary_includes_name_and_input() {
        let s = format_tool_summary("bash", "ls -la");
        assert!(s.contains("bash"));
        assert!(s.contains("ls -la"));
    }

    #[tokio::test]
    async fn new_projector_starts_with_no_sessions() {
        let transport = Arc::new(TelegramTransport::new("123:TEST"));
        let agent = Arc::new(crate::agent::mock::MockAgentClient::new());
        let pending = Arc::new(PendingRegistry::new());
        let projector = StreamingProjector::new(transport, agent, pending, 1, None, None);
        assert!(projector.sessions.lock().await.is_empty());
    }
}
