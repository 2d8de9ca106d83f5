//! The agent's event stream vocabulary (spec §4.8). The agent process
//! itself is out of core scope (spec §1); this enum is the wire contract
//! the streaming projector (C8) consumes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusKind {
    Busy,
    Idle,
    Retry,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub status: TodoStatus,
}

/// One incremental fragment of an assistant message (spec GLOSSARY "Part").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Part {
    Text { id: String, content: String },
    Reasoning { id: String, content: String },
    Tool { id: String, name: String, input: String, status: ToolStatus },
    StepStart { id: String },
    StepFinish { id: String },
    Patch { id: String },
    TodoWrite { id: String, items: Vec<TodoItem> },
    Other { id: String, kind: String, payload: serde_json::Value },
}

impl Part {
    pub fn id(&self) -> &str {
        match self {
            Part::Text { id, .. }
            | Part::Reasoning { id, .. }
            | Part::Tool { id, .. }
            | Part::StepStart { id }
            | Part::StepFinish { id }
            | Part::Patch { id }
            | Part::TodoWrite { id, .. }
            | Part::Other { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub text: String,
    pub options: Vec<String>,
}

/// Events emitted by the agent, in the order the projector must handle
/// them (spec §4.8). Deserialized by hand (rather than a derived,
/// internally-tagged enum) so an unrecognized `type` keeps its raw
/// payload for the projector's debug dump instead of being discarded.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    #[serde(rename = "session.status")]
    SessionStatus { session_id: String, status: SessionStatusKind, detail: Option<String> },
    #[serde(rename = "session.created")]
    SessionCreated { session_id: String },
    #[serde(rename = "session.idle")]
    SessionIdle { session_id: String },
    #[serde(rename = "session.error")]
    SessionError { session_id: String, message: String, aborted: bool },
    #[serde(rename = "session.diff")]
    SessionDiff { session_id: String },
    #[serde(rename = "message.updated")]
    MessageUpdated { session_id: String, message_id: String, role: MessageRole },
    #[serde(rename = "message.part.updated")]
    MessagePartUpdated { session_id: String, message_id: String, part: Part },
    #[serde(rename = "question.asked")]
    QuestionAsked {
        request_id: String,
        chat_id: i64,
        thread_id: Option<i64>,
        questions: Vec<QuestionOption>,
    },
    #[serde(rename = "permission.asked")]
    PermissionAsked {
        request_id: String,
        chat_id: i64,
        thread_id: Option<i64>,
        permission: String,
        patterns: Vec<String>,
    },
    Unknown { kind: String, payload: serde_json::Value },
}

impl AgentEvent {
    /// Parses a raw JSON event, falling back to `Unknown` (with the raw
    /// payload preserved) for any `type` this enum doesn't model or any
    /// event whose fields don't match -- spec §4.8 "any unrecognized
    /// type -- log and surface a YAML-ish dump".
    pub fn from_json(value: serde_json::Value) -> AgentEvent {
        let kind = value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        #[derive(Deserialize)]
        #[serde(tag = "type", rename_all = "snake_case")]
        enum Wire {
            #[serde(rename = "session.status")]
            SessionStatus { session_id: String, status: SessionStatusKind, #[serde(default)] detail: Option<String> },
            #[serde(rename = "session.created")]
            SessionCreated { session_id: String },
            #[serde(rename = "session.idle")]
            SessionIdle { session_id: String },
            #[serde(rename = "session.error")]
            SessionError { session_id: String, message: String, #[serde(default)] aborted: bool },
            #[serde(rename = "session.diff")]
            SessionDiff { session_id: String },
            #[serde(rename = "message.updated")]
            MessageUpdated { session_id: String, message_id: String, role: MessageRole },
            #[serde(rename = "message.part.updated")]
            MessagePartUpdated { session_id: String, message_id: String, part: Part },
            #[serde(rename = "question.asked")]
            QuestionAsked {
                request_id: String,
                chat_id: i64,
                #[serde(default)]
                thread_id: Option<i64>,
                questions: Vec<QuestionOption>,
            },
            #[serde(rename = "permission.asked")]
            PermissionAsked {
                request_id: String,
                chat_id: i64,
                #[serde(default)]
                thread_id: Option<i64>,
                permission: String,
                #[serde(default)]
                patterns: Vec<String>,
            },
        }

        match serde_json::from_value::<Wire>(value.clone()) {
            Ok(Wire::SessionStatus { session_id, status, detail }) => {
                AgentEvent::SessionStatus { session_id, status, detail }
            }
            Ok(Wire::SessionCreated { session_id }) => AgentEvent::SessionCreated { session_id },
            Ok(Wire::SessionIdle { session_id }) => AgentEvent::SessionIdle { session_id },
            Ok(Wire::SessionError { session_id, message, aborted }) => {
                AgentEvent::SessionError { session_id, message, aborted }
            }
            Ok(Wire::SessionDiff { session_id }) => AgentEvent::SessionDiff { session_id },
            Ok(Wire::MessageUpdated { session_id, message_id, role }) => {
                AgentEvent::MessageUpdated { session_id, message_id, role }
            }
            Ok(Wire::MessagePartUpdated { session_id, message_id, part }) => {
                AgentEvent::MessagePartUpdated { session_id, message_id, part }
            }
            Ok(Wire::QuestionAsked { request_id, chat_id, thread_id, questions }) => {
                AgentEvent::QuestionAsked { request_id, chat_id, thread_id, questions }
            }
            Ok(Wire::PermissionAsked { request_id, chat_id, thread_id, permission, patterns }) => {
                AgentEvent::PermissionAsked { request_id, chat_id, thread_id, permission, patterns }
            }
            Err(_) => AgentEvent::Unknown { kind, payload: value },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_session_status() {
        let v = serde_json::json!({"type": "session.status", "session_id": "s1", "status": "busy"});
        let ev = AgentEvent::from_json(v);
        assert!(matches!(ev, AgentEvent::SessionStatus { status: SessionStatusKind::Busy, .. }));
    }

    #[test]
    fn unknown_type_keeps_raw_payload() {
        let v = serde_json::json!({"type": "session.weird", "foo": "bar"});
        let ev = AgentEvent::from_json(v.clone());
        match ev {
            AgentEvent::Unknown { kind, payload } => {
                assert_eq!(kind, "session.weird");
                assert_eq!(payload, v);
            }
            _ => panic!("expected Unknown"),
        }
    }

    #[test]
    fn part_id_extracts_from_every_variant() {
        let p = Part::Text { id: "p1".into(), content: "hi".into() };
        assert_eq!(p.id(), "p1");
    }
}
