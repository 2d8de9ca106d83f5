//! Agent collaborator surface (spec §1, SPEC_FULL.md §11): the agent's own
//! internal logic and embedded-process launcher are out of core scope, but
//! the streaming projector (C8) and command router (C7) still need a
//! concrete seam to call across. `AgentClient` is that seam; the teacher's
//! `execute_command_streaming` already separates "spawn a child and parse
//! its JSONL" from "drive a channel of `StreamMessage`s" -- this trait's
//! `events()` plays the same role, generalized to the richer vocabulary of
//! spec §4.8 instead of the teacher's six `StreamMessage` variants.

pub mod events;
pub mod mock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BridgeError;
use crate::session::{ModelRef, PermissionDecision};
use events::AgentEvent;

/// One piece of a submitted prompt: plain text, or a file delivered as a
/// data URL (spec §4.7 step 5: photo/voice/text parts).
#[derive(Debug, Clone)]
pub enum PromptPart {
    Text(String),
    DataUrlFile { mime: String, data_url: String, name: String },
}

/// Result of the async title-generation RPC (spec §4.7: "agent reply is
/// one of `{type:"title", value}` or `{type:"unknown", value}`").
#[derive(Debug, Clone)]
pub enum TitleResult {
    Title(String),
    Unknown(String),
}

/// The external-process boundary the router and projector call across.
/// Implementations own the actual agent subprocess/HTTP client; this crate
/// only specifies the operations spec §4.7/§4.9 need.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Submits a prompt, creating a session first if `session_id` is
    /// `None`. Returns the (possibly newly created) session id.
    async fn submit_prompt(
        &self,
        session_id: Option<&str>,
        parts: Vec<PromptPart>,
        model: Option<&ModelRef>,
    ) -> Result<String, BridgeError>;

    /// Aborts the in-flight turn for `session_id` (`x` / `/interrupt`).
    async fn abort(&self, session_id: &str) -> Result<(), BridgeError>;

    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<(), BridgeError>;

    async fn reject_question(&self, request_id: &str) -> Result<(), BridgeError>;

    async fn reply_permission(&self, request_id: &str, decision: PermissionDecision) -> Result<(), BridgeError>;

    async fn list_models(&self) -> Result<Vec<ModelRef>, BridgeError>;

    async fn generate_title(&self, session_id: &str, first_message: &str) -> Result<TitleResult, BridgeError>;

    /// Hands back the receiving end of this client's event stream. Called
    /// once by the streaming projector at startup.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent>;
}
