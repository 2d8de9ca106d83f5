//! Pending-interaction registry (C9), spec §4.9: opens a Telegram prompt
//! for each `question.asked`/`permission.asked` event, routes callback
//! data and freetext replies back to it, and calls the matching
//! `AgentClient` reply/reject method when the interaction resolves.
//!
//! Callback data is the free-form key spec's design notes describe: it
//! carries `(chatId, threadId, questionIdx, optionValue)` directly so a
//! restart doesn't orphan in-flight prompts server-side -- it just means
//! the local [`crate::session::PendingInteractions`] map is gone and the
//! callback answers "This has expired".

use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup, MessageId};
use tokio::sync::Mutex;

use crate::agent::AgentClient;
use crate::session::{Cancelled, PendingInteractions, PendingKey, PendingPermission, PendingQuestion, PermissionDecision};

use super::transport::{permission_keyboard, question_keyboard, TelegramTransport};

/// An explicit empty keyboard: `editMessageText` only touches
/// `reply_markup` when one is passed, so removing a prompt's buttons
/// (spec §4.9 "remove the keyboard") requires sending this rather than
/// `None`.
fn cleared_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(Vec::<Vec<InlineKeyboardButton>>::new())
}

pub struct PendingRegistry {
    inner: Mutex<PendingInteractions>,
}

impl PendingRegistry {
    pub fn new() -> Self {
        PendingRegistry { inner: Mutex::new(PendingInteractions::new()) }
    }

    /// Opens a question prompt: one Telegram message per question with up
    /// to 7 option buttons plus `Other` (spec §4.9). Whatever prompt this
    /// displaces is cancelled on the agent side first.
    pub async fn open_question(
        &self,
        transport: &TelegramTransport,
        agent: &dyn AgentClient,
        request_id: String,
        chat_id: i64,
        thread_id: Option<i64>,
        questions: Vec<crate::session::QuestionPrompt>,
    ) {
        let key: PendingKey = (chat_id, thread_id);
        let mut message_ids = Vec::new();
        for (idx, q) in questions.iter().enumerate() {
            let markup = question_keyboard(chat_id, thread_id, idx, &q.options);
            match transport
                .send_message(ChatId(chat_id), thread_id, &q.text, Some(markup), None)
                .await
            {
                Ok(sent) => message_ids.push(sent.message_id),
                Err(e) => tracing::warn!(error = %e, "failed to send question prompt"),
            }
        }

        let pending = PendingQuestion {
            request_id,
            chat_id,
            thread_id,
            questions,
            answers: Default::default(),
            message_ids,
            awaiting_freetext_idx: None,
        };

        let displaced = {
            let mut guard = self.inner.lock().await;
            guard.insert_question(key, pending)
        };
        self.reject_displaced(agent, displaced).await;
    }

    pub async fn open_permission(
        &self,
        transport: &TelegramTransport,
        agent: &dyn AgentClient,
        request_id: String,
        chat_id: i64,
        thread_id: Option<i64>,
        permission: String,
        patterns: Vec<String>,
    ) {
        let key: PendingKey = (chat_id, thread_id);
        let text = format!("Permission requested: {permission}\n{}", patterns.join(", "));
        let markup = permission_keyboard(chat_id, thread_id);
        let message_id = match transport
            .send_message(ChatId(chat_id), thread_id, &text, Some(markup), None)
            .await
        {
            Ok(sent) => sent.message_id,
            Err(e) => {
                tracing::warn!(error = %e, "failed to send permission prompt");
                return;
            }
        };

        let pending = PendingPermission { request_id, chat_id, thread_id, permission, patterns, message_id };
        let displaced = {
            let mut guard = self.inner.lock().await;
            guard.insert_permission(key, pending)
        };
        self.reject_displaced(agent, displaced).await;
    }

    /// Handles `q:<chatId>:<threadId>:<qIdx>:<optIdx|"other">` (spec §4.7,
    /// §4.9). Returns `true` if the callback referred to a still-live
    /// prompt, `false` if it expired (caller should `show_alert`).
    pub async fn handle_question_callback(
        &self,
        transport: &TelegramTransport,
        agent: &dyn AgentClient,
        chat_id: i64,
        thread_id: Option<i64>,
        q_idx: usize,
        selection: QuestionSelection,
    ) -> bool {
        let key: PendingKey = (chat_id, thread_id);
        let mut guard = self.inner.lock().await;
        let Some(q) = guard.question_mut(&key) else { return false };
        if q_idx >= q.message_ids.len() {
            return false;
        }
        let message_id = q.message_ids[q_idx];

        match selection {
            QuestionSelection::Option(opt_idx) => {
                let Some(prompt) = q.questions.get(q_idx) else { return false };
                let Some(label) = prompt.options.get(opt_idx) else { return false };
                let label = label.clone();
                q.answers.insert(q_idx, vec![label.clone()]);
                let text = format!("{}\n\n_{}_", q.questions[q_idx].text, label);
                let complete = q.is_complete();
                let request_id = q.request_id.clone();
                let ordered = q.ordered_answers();
                drop(guard);

                let _ = transport
                    .edit_message(ChatId(chat_id), MessageId(message_id), &text, Some(cleared_keyboard()))
                    .await;
                if complete {
                    let _ = agent.reply_question(&request_id, ordered).await;
                    self.inner.lock().await.take_question(&key);
                }
                true
            }
            QuestionSelection::Other => {
                q.awaiting_freetext_idx = Some(q_idx);
                drop(guard);
                let _ = transport
                    .edit_message(
                        ChatId(chat_id),
                        MessageId(message_id),
                        "Please type your answer:",
                        Some(cleared_keyboard()),
                    )
                    .await;
                true
            }
        }
    }

    /// Handles `p:<chatId>:<threadId>:<once|always|reject>` (spec §4.7,
    /// §4.9).
    pub async fn handle_permission_callback(
        &self,
        transport: &TelegramTransport,
        agent: &dyn AgentClient,
        chat_id: i64,
        thread_id: Option<i64>,
        decision: PermissionDecision,
    ) -> bool {
        let key: PendingKey = (chat_id, thread_id);
        let Some(p) = self.inner.lock().await.take_permission(&key) else { return false };

        let verdict = match decision {
            PermissionDecision::AcceptOnce => "Accepted",
            PermissionDecision::AcceptAlways => "Accepted (always)",
            PermissionDecision::Reject => "Denied",
        };
        let text = format!("Permission requested: {}\n{}\n\n_{}_", p.permission, p.patterns.join(", "), verdict);
        let _ = transport
            .edit_message(ChatId(chat_id), MessageId(p.message_id), &text, Some(cleared_keyboard()))
            .await;
        let _ = agent.reply_permission(&p.request_id, decision).await;
        true
    }

    /// If a freetext answer is awaited on this key, consumes it as the
    /// answer and returns `true` (spec §4.7 step 1). Otherwise `false`.
    pub async fn try_handle_freetext_answer(
        &self,
        transport: &TelegramTransport,
        agent: &dyn AgentClient,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
    ) -> bool {
        let key: PendingKey = (chat_id, thread_id);
        let mut guard = self.inner.lock().await;
        let Some(q) = guard.question_mut(&key) else { return false };
        let Some(idx) = q.awaiting_freetext_idx else { return false };

        q.answers.insert(idx, vec![text.to_string()]);
        q.awaiting_freetext_idx = None;
        let message_id = q.message_ids.get(idx).copied();
        let complete = q.is_complete();
        let request_id = q.request_id.clone();
        let ordered = q.ordered_answers();
        drop(guard);

        if let Some(mid) = message_id {
            let edited = format!("_{}_", text);
            let _ = transport
                .edit_message(ChatId(chat_id), MessageId(mid), &edited, Some(cleared_keyboard()))
                .await;
        }
        if complete {
            let _ = agent.reply_question(&request_id, ordered).await;
            self.inner.lock().await.take_question(&key);
        }
        true
    }

    pub async fn is_awaiting_freetext(&self, chat_id: i64, thread_id: Option<i64>) -> bool {
        let key: PendingKey = (chat_id, thread_id);
        self.inner
            .lock()
            .await
            .question(&key)
            .map(|q| q.awaiting_freetext_idx.is_some())
            .unwrap_or(false)
    }

    pub async fn has_pending(&self, chat_id: i64, thread_id: Option<i64>) -> bool {
        let key: PendingKey = (chat_id, thread_id);
        self.inner.lock().await.count(&key) > 0
    }

    /// Cancels anything pending for `key`: questions get `question.reject`,
    /// permissions get `permission.reply(reject)` (spec §4.7 step 2).
    pub async fn cancel_for_key(&self, agent: &dyn AgentClient, chat_id: i64, thread_id: Option<i64>) {
        let key: PendingKey = (chat_id, thread_id);
        let cancelled = self.inner.lock().await.take_any(&key);
        for c in cancelled {
            match c {
                Cancelled::Question(q) => {
                    let _ = agent.reject_question(&q.request_id).await;
                }
                Cancelled::Permission(p) => {
                    let _ = agent.reply_permission(&p.request_id, PermissionDecision::Reject).await;
                }
            }
        }
    }

    async fn reject_displaced(&self, agent: &dyn AgentClient, displaced: Option<Cancelled>) {
        match displaced {
            Some(Cancelled::Question(q)) => {
                let _ = agent.reject_question(&q.request_id).await;
            }
            Some(Cancelled::Permission(p)) => {
                let _ = agent.reply_permission(&p.request_id, PermissionDecision::Reject).await;
            }
            None => {}
        }
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        PendingRegistry::new()
    }
}

pub enum QuestionSelection {
    Option(usize),
    Other,
}

/// Parses `q:<chatId>:<threadId>:<qIdx>:<optIdx|"other">` callback data
/// (spec §4.7, §4.9).
pub fn parse_question_callback(data: &str) -> Option<(i64, Option<i64>, usize, QuestionSelection)> {
    let rest = data.strip_prefix("q:")?;
    let mut parts = rest.splitn(4, ':');
    let chat_id: i64 = parts.next()?.parse().ok()?;
    let thread_raw = parts.next()?;
    let thread_id = if thread_raw.is_empty() { None } else { thread_raw.parse().ok() };
    let q_idx: usize = parts.next()?.parse().ok()?;
    let opt = parts.next()?;
    let selection = if opt == "other" {
        QuestionSelection::Other
    } else {
        QuestionSelection::Option(opt.parse().ok()?)
    };
    Some((chat_id, thread_id, q_idx, selection))
}

/// Parses `p:<chatId>:<threadId>:<once|always|reject>` callback data.
pub fn parse_permission_callback(data: &str) -> Option<(i64, Option<i64>, PermissionDecision)> {
    let rest = data.strip_prefix("p:")?;
    let mut parts = rest.splitn(3, ':');
    let chat_id: i64 = parts.next()?.parse().ok()?;
    let thread_raw = parts.next()?;
    let thread_id = if thread_raw.is_empty() { None } else { thread_raw.parse().ok() };
    let decision = match parts.next()? {
        "once" => PermissionDecision::AcceptOnce,
        "always" => PermissionDecision::AcceptAlways,
        "reject" => PermissionDecision::Reject,
        _ => return None,
    };
    Some((chat_id, thread_id, decision))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_option_callback() {
        let (chat, thread, idx, sel) = parse_question_callback("q:100:7:0:3").unwrap();
        assert_eq!(chat, 100);
        assert_eq!(thread, Some(7));
        assert_eq!(idx, 0);
        assert!(matches!(sel, QuestionSelection::Option(3)));
    }

    #[test]
    fn parses_other_callback_without_thread() {
        let (chat, thread, idx, sel) = parse_question_callback("q:100::1:other").unwrap();
        assert_eq!(chat, 100);
        assert_eq!(thread, None);
        assert_eq!(idx, 1);
        assert!(matches!(sel, QuestionSelection::Other));
    }

    #[test]
    fn parses_permission_callback() {
        let (chat, thread, decision) = parse_permission_callback("p:5:9:always").unwrap();
        assert_eq!(chat, 5);
        assert_eq!(thread, Some(9));
        assert_eq!(decision, PermissionDecision::AcceptAlways);
    }

    #[tokio::test]
    async fn has_pending_reflects_open_question() {
        let registry = PendingRegistry::new();
        assert!(!registry.has_pending(1, None).await);
    }
}
