//! In-memory entities (spec §3.2): one [`Session`] per instance, plus the
//! [`PendingQuestion`]/[`PendingPermission`] prompts and per-message
//! [`StreamState`] the streaming projector (C8) keeps while a turn is live.
//!
//! None of this is persisted -- a restart loses in-flight prompts, which is
//! why callback data (spec §4.9) is self-describing instead of pointing at
//! server-side state.

use std::collections::HashMap;
use std::time::Instant;

/// A model selection the user picked with `/model <provider>/<model>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl ModelRef {
    pub fn parse(spec: &str) -> Option<ModelRef> {
        let (provider, model) = spec.split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(ModelRef {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// At most one active session per instance (spec §3.2).
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub title: Option<String>,
    pub title_known: bool,
    pub selected_model: Option<ModelRef>,
}

impl Session {
    pub fn new(id: String) -> Session {
        Session {
            id,
            title: None,
            title_known: false,
            selected_model: None,
        }
    }
}

/// Key identifying one Telegram forum topic (or the chat itself, when no
/// topic is configured).
pub type PendingKey = (i64, Option<i64>);

#[derive(Debug, Clone)]
pub struct QuestionPrompt {
    pub text: String,
    pub options: Vec<String>,
}

/// One outstanding `question.asked` request (spec §3.2, §4.9).
#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub request_id: String,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub questions: Vec<QuestionPrompt>,
    /// index -> ordered list of answer strings for that question.
    pub answers: HashMap<usize, Vec<String>>,
    /// Telegram message id of the prompt for each question, in order.
    pub message_ids: Vec<i32>,
    pub awaiting_freetext_idx: Option<usize>,
}

impl PendingQuestion {
    pub fn answered_count(&self) -> usize {
        self.answers.len()
    }

    pub fn is_complete(&self) -> bool {
        self.answered_count() == self.questions.len()
    }

    /// Ordered answer arrays, one per question, for `question.reply`.
    pub fn ordered_answers(&self) -> Vec<Vec<String>> {
        (0..self.questions.len())
            .map(|i| self.answers.get(&i).cloned().unwrap_or_default())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    AcceptOnce,
    AcceptAlways,
    Reject,
}

/// One outstanding `permission.asked` request (spec §3.2, §4.9).
#[derive(Debug, Clone)]
pub struct PendingPermission {
    pub request_id: String,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub permission: String,
    pub patterns: Vec<String>,
    pub message_id: i32,
}

/// Both pending-interaction kinds, keyed by `(chatId, threadId)`. A second
/// prompt for the same key replaces (and logically cancels) the first --
/// spec §3.2.
#[derive(Default)]
pub struct PendingInteractions {
    questions: HashMap<PendingKey, PendingQuestion>,
    permissions: HashMap<PendingKey, PendingPermission>,
}

/// What must happen to the interaction that was replaced/cancelled.
pub enum Cancelled {
    Question(PendingQuestion),
    Permission(PendingPermission),
}

impl PendingInteractions {
    pub fn new() -> Self {
        PendingInteractions::default()
    }

    pub fn question(&self, key: &PendingKey) -> Option<&PendingQuestion> {
        self.questions.get(key)
    }

    pub fn question_mut(&mut self, key: &PendingKey) -> Option<&mut PendingQuestion> {
        self.questions.get_mut(key)
    }

    pub fn permission(&self, key: &PendingKey) -> Option<&PendingPermission> {
        self.permissions.get(key)
    }

    /// Inserts a question prompt, returning whatever it displaced so the
    /// caller can reject it on the agent side (spec §4.7 step 2).
    pub fn insert_question(&mut self, key: PendingKey, q: PendingQuestion) -> Option<Cancelled> {
        self.questions.insert(key, q).map(Cancelled::Question)
    }

    pub fn insert_permission(&mut self, key: PendingKey, p: PendingPermission) -> Option<Cancelled> {
        self.permissions.insert(key, p).map(Cancelled::Permission)
    }

    pub fn take_question(&mut self, key: &PendingKey) -> Option<PendingQuestion> {
        self.questions.remove(key)
    }

    pub fn take_permission(&mut self, key: &PendingKey) -> Option<PendingPermission> {
        self.permissions.remove(key)
    }

    /// Drains anything pending for `key` (spec §4.7 step 2: "cancellation").
    pub fn take_any(&mut self, key: &PendingKey) -> Vec<Cancelled> {
        let mut out = Vec::new();
        if let Some(q) = self.questions.remove(key) {
            out.push(Cancelled::Question(q));
        }
        if let Some(p) = self.permissions.remove(key) {
            out.push(Cancelled::Permission(p));
        }
        out
    }

    /// `|PendingQuestion|+|PendingPermission| <= 2` for this key, always
    /// true by construction (spec §8 P4) since each map holds at most one
    /// entry per key.
    pub fn count(&self, key: &PendingKey) -> usize {
        self.questions.contains_key(key) as usize + self.permissions.contains_key(key) as usize
    }
}

/// Throttled Telegram message state for one streamed piece of content
/// (spec §3.2 StreamState, §4.8.1/4.8.2).
#[derive(Debug, Clone)]
pub struct ThrottledMessage {
    pub message_id: Option<i32>,
    pub content: String,
    pub last_edit: Option<Instant>,
    pub markdown_ok: bool,
    /// Byte offset into `content` already finalized into an earlier,
    /// no-longer-edited Telegram message by the spec §4.8.1 step 6 early
    /// flush. Only the `content[sent_prefix_len..]` tail is still live.
    pub sent_prefix_len: usize,
}

impl Default for ThrottledMessage {
    fn default() -> Self {
        ThrottledMessage {
            message_id: None,
            content: String::new(),
            last_edit: None,
            markdown_ok: true,
            sent_prefix_len: 0,
        }
    }
}

/// Per-(session, assistant message) stream state: which parts were already
/// sent (dedup via `sent_part_ids`), plus the reasoning/text throttled
/// messages this message owns.
#[derive(Default)]
pub struct StreamState {
    pub sent_part_ids: std::collections::HashSet<String>,
    pub reasoning: Option<ThrottledMessage>,
    pub text: Option<ThrottledMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_parses_provider_slash_model() {
        let m = ModelRef::parse("anthropic/claude-opus").unwrap();
        assert_eq!(m.provider, "anthropic");
        assert_eq!(m.model, "claude-opus");
    }

    #[test]
    fn model_ref_rejects_missing_slash() {
        assert!(ModelRef::parse("anthropic").is_none());
    }

    #[test]
    fn pending_question_completes_when_all_answered() {
        let mut q = PendingQuestion {
            request_id: "r1".into(),
            chat_id: 1,
            thread_id: None,
            questions: vec![
                QuestionPrompt { text: "a?".into(), options: vec!["x".into()] },
                QuestionPrompt { text: "b?".into(), options: vec!["y".into()] },
            ],
            answers: HashMap::new(),
            message_ids: vec![10, 11],
            awaiting_freetext_idx: None,
        };
        assert!(!q.is_complete());
        q.answers.insert(0, vec!["x".into()]);
        assert!(!q.is_complete());
        q.answers.insert(1, vec!["y".into()]);
        assert!(q.is_complete());
        assert_eq!(q.ordered_answers(), vec![vec!["x".to_string()], vec!["y".to_string()]]);
    }

    #[test]
    fn inserting_a_second_question_returns_the_first_as_cancelled() {
        let mut pending = PendingInteractions::new();
        let key = (1, None);
        let q1 = PendingQuestion {
            request_id: "r1".into(),
            chat_id: 1,
            thread_id: None,
            questions: vec![],
            answers: HashMap::new(),
            message_ids: vec![],
            awaiting_freetext_idx: None,
        };
        assert!(pending.insert_question(key, q1).is_none());
        let q2 = PendingQuestion {
            request_id: "r2".into(),
            chat_id: 1,
            thread_id: None,
            questions: vec![],
            answers: HashMap::new(),
            message_ids: vec![],
            awaiting_freetext_idx: None,
        };
        let displaced = pending.insert_question(key, q2);
        assert!(matches!(displaced, Some(Cancelled::Question(q)) if q.request_id == "r1"));
    }

    #[test]
    fn count_is_at_most_two_per_key() {
        let mut pending = PendingInteractions::new();
        let key = (5, Some(7));
        assert_eq!(pending.count(&key), 0);
        pending.insert_permission(
            key,
            PendingPermission {
                request_id: "p1".into(),
                chat_id: 5,
                thread_id: Some(7),
                permission: "edit".into(),
                patterns: vec![],
                message_id: 1,
            },
        );
        assert_eq!(pending.count(&key), 1);
    }
}
