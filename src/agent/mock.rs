//! In-process stub [`AgentClient`](super::AgentClient) for projector/router
//! unit tests -- the way the teacher's `execute_command_streaming` is
//! tested by driving a channel of `StreamMessage`s directly rather than
//! spawning a real child process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::events::AgentEvent;
use super::{AgentClient, PromptPart, TitleResult};
use crate::error::BridgeError;
use crate::session::{ModelRef, PermissionDecision};

#[derive(Debug, Clone)]
pub enum MockCall {
    SubmitPrompt { session_id: Option<String>, parts: Vec<String> },
    Abort { session_id: String },
    ReplyQuestion { request_id: String, answers: Vec<Vec<String>> },
    RejectQuestion { request_id: String },
    ReplyPermission { request_id: String, decision: PermissionDecision },
}

/// Records every call it receives and replays a fixed event stream,
/// letting tests assert both "what was sent to the agent" and "what the
/// projector does when fed a scripted stream".
pub struct MockAgentClient {
    calls: Mutex<Vec<MockCall>>,
    next_session_id: AtomicU64,
    events_tx: mpsc::UnboundedSender<AgentEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
    models: Vec<ModelRef>,
    title: TitleResult,
}

impl MockAgentClient {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MockAgentClient {
            calls: Mutex::new(Vec::new()),
            next_session_id: AtomicU64::new(1),
            events_tx: tx,
            events_rx: Mutex::new(Some(rx)),
            models: vec![
                ModelRef { provider: "anthropic".into(), model: "claude-opus".into() },
                ModelRef { provider: "openai".into(), model: "gpt-5".into() },
            ],
            title: TitleResult::Title("Untitled session".into()),
        }
    }

    pub fn with_title(mut self, title: TitleResult) -> Self {
        self.title = title;
        self
    }

    /// Pushes an event as if the agent had emitted it.
    pub fn push_event(&self, event: AgentEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for MockAgentClient {
    fn default() -> Self {
        MockAgentClient::new()
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    async fn submit_prompt(
        &self,
        session_id: Option<&str>,
        parts: Vec<PromptPart>,
        _model: Option<&ModelRef>,
    ) -> Result<String, BridgeError> {
        let sid = session_id.map(|s| s.to_string()).unwrap_or_else(|| {
            format!("mock-session-{}", self.next_session_id.fetch_add(1, Ordering::SeqCst))
        });
        let textual: Vec<String> = parts
            .into_iter()
            .map(|p| match p {
                PromptPart::Text(t) => t,
                PromptPart::DataUrlFile { name, .. } => format!("<file:{name}>"),
            })
            .collect();
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall::SubmitPrompt { session_id: Some(sid.clone()), parts: textual });
        Ok(sid)
    }

    async fn abort(&self, session_id: &str) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall::Abort { session_id: session_id.to_string() });
        Ok(())
    }

    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall::ReplyQuestion { request_id: request_id.to_string(), answers });
        Ok(())
    }

    async fn reject_question(&self, request_id: &str) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall::RejectQuestion { request_id: request_id.to_string() });
        Ok(())
    }

    async fn reply_permission(&self, request_id: &str, decision: PermissionDecision) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(MockCall::ReplyPermission { request_id: request_id.to_string(), decision });
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelRef>, BridgeError> {
        Ok(self.models.clone())
    }

    async fn generate_title(&self, _session_id: &str, _first_message: &str) -> Result<TitleResult, BridgeError> {
        Ok(match &self.title {
            TitleResult::Title(t) => TitleResult::Title(t.clone()),
            TitleResult::Unknown(v) => TitleResult::Unknown(v.clone()),
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("subscribe() called more than once on MockAgentClient")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_prompt_without_session_creates_one() {
        let client = MockAgentClient::new();
        let sid = client
            .submit_prompt(None, vec![PromptPart::Text("hi".into())], None)
            .await
            .unwrap();
        assert!(sid.starts_with("mock-session-"));
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn pushed_events_are_observable_via_subscribe() {
        let client = MockAgentClient::new();
        let mut rx = client.subscribe();
        client.push_event(AgentEvent::SessionIdle { session_id: "s1".into() });
        let ev = rx.recv().await.unwrap();
        assert!(matches!(ev, AgentEvent::SessionIdle { .. }));
    }
}
