//! Entry point (spec §6.5, §12): thin CLI that loads config, wires every
//! component together, and hands off to the long-lived ingest/projector
//! loops until a signal asks it to stop.
//!
//! Grounded in the teacher's terse `main()` (parse args, validate, print a
//! short banner, hand off to `telegram::run_bot`) and in
//! `titan-ralph-orchestrator`'s `ralph-telegram::daemon.rs` for the
//! SIGINT/SIGTERM-driven `AtomicBool` shutdown around the daemon loop.

mod agent;
mod bash;
mod config;
mod device;
mod election;
mod error;
mod heartbeat;
mod registry;
mod session;
mod store;
mod telegram;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};

use crate::agent::events::AgentEvent;
use crate::agent::{AgentClient, PromptPart, TitleResult};
use crate::bash::BashTable;
use crate::config::Config;
use crate::error::BridgeError;
use crate::registry::{DeviceRecord, Registry};
use crate::session::{ModelRef, PermissionDecision};
use crate::store::SharedStore;
use crate::telegram::ingest::{now_millis, IngestLoop};
use crate::telegram::pending::PendingRegistry;
use crate::telegram::router::Router;
use crate::telegram::streaming::StreamingProjector;
use crate::telegram::transport::TelegramTransport;

const DEFAULT_OPENCODE_URL: &str = "http://127.0.0.1:4096";

#[derive(Parser, Debug)]
#[command(version, about = "Per-session bridge between a local coding agent and a Telegram forum channel")]
struct Cli {
    /// Working directory this instance serves (defaults to the current directory)
    #[arg(value_name = "DIRECTORY")]
    directory: Option<String>,

    /// Resumes an existing agent session instead of starting a new one
    #[arg(value_name = "SESSION_ID")]
    session_id: Option<String>,
}

/// Thin HTTP binding to the local agent process (spec §11: "out of scope
/// internals, in-scope interface"). Every call is a best-effort `reqwest`
/// round trip against `opencode_url`; failures surface as
/// [`BridgeError::AgentTransient`] so callers degrade the way spec §7
/// describes rather than crash the bridge.
struct HttpAgentClient {
    base_url: String,
    http: reqwest::Client,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
}

impl HttpAgentClient {
    fn spawn(base_url: String) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(HttpAgentClient {
            base_url: base_url.clone(),
            http: reqwest::Client::new(),
            events_rx: std::sync::Mutex::new(Some(rx)),
        });
        tokio::spawn(run_event_stream(format!("{base_url}/event"), tx));
        client
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, BridgeError> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::AgentTransient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BridgeError::AgentTransient(format!("{path} returned HTTP {}", resp.status())));
        }
        resp.json().await.map_err(|e| BridgeError::AgentTransient(e.to_string()))
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, BridgeError> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| BridgeError::AgentTransient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BridgeError::AgentTransient(format!("{path} returned HTTP {}", resp.status())));
        }
        resp.json().await.map_err(|e| BridgeError::AgentTransient(e.to_string()))
    }
}

fn prompt_part_json(part: PromptPart) -> serde_json::Value {
    match part {
        PromptPart::Text(text) => serde_json::json!({ "type": "text", "text": text }),
        PromptPart::DataUrlFile { mime, data_url, name } => {
            serde_json::json!({ "type": "file", "mime": mime, "url": data_url, "filename": name })
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn submit_prompt(
        &self,
        session_id: Option<&str>,
        parts: Vec<PromptPart>,
        model: Option<&ModelRef>,
    ) -> Result<String, BridgeError> {
        let id = match session_id {
            Some(id) => id.to_string(),
            None => {
                let created = self.post_json("/session", serde_json::json!({})).await?;
                created
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| BridgeError::AgentTransient("session create response missing id".into()))?
                    .to_string()
            }
        };
        let parts_json: Vec<serde_json::Value> = parts.into_iter().map(prompt_part_json).collect();
        let mut body = serde_json::json!({ "parts": parts_json });
        if let Some(m) = model {
            body["model"] = serde_json::json!({ "provider": m.provider, "model": m.model });
        }
        self.post_json(&format!("/session/{id}/message"), body).await?;
        Ok(id)
    }

    async fn abort(&self, session_id: &str) -> Result<(), BridgeError> {
        self.post_json(&format!("/session/{session_id}/abort"), serde_json::json!({})).await?;
        Ok(())
    }

    async fn reply_question(&self, request_id: &str, answers: Vec<Vec<String>>) -> Result<(), BridgeError> {
        self.post_json(&format!("/question/{request_id}/reply"), serde_json::json!({ "answers": answers })).await?;
        Ok(())
    }

    async fn reject_question(&self, request_id: &str) -> Result<(), BridgeError> {
        self.post_json(&format!("/question/{request_id}/reject"), serde_json::json!({})).await?;
        Ok(())
    }

    async fn reply_permission(&self, request_id: &str, decision: PermissionDecision) -> Result<(), BridgeError> {
        let decision_str = match decision {
            PermissionDecision::AcceptOnce => "once",
            PermissionDecision::AcceptAlways => "always",
            PermissionDecision::Reject => "reject",
        };
        self.post_json(&format!("/permission/{request_id}/reply"), serde_json::json!({ "decision": decision_str }))
            .await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<ModelRef>, BridgeError> {
        let body = self.get_json("/config/providers").await?;
        let mut out = Vec::new();
        if let Some(providers) = body.get("providers").and_then(|v| v.as_array()) {
            for provider in providers {
                let Some(provider_id) = provider.get("id").and_then(|v| v.as_str()) else { continue };
                let Some(models) = provider.get("models").and_then(|v| v.as_array()) else { continue };
                for model in models {
                    if let Some(model_id) = model.get("id").and_then(|v| v.as_str()) {
                        out.push(ModelRef { provider: provider_id.to_string(), model: model_id.to_string() });
                    }
                }
            }
        }
        Ok(out)
    }

    async fn generate_title(&self, session_id: &str, first_message: &str) -> Result<TitleResult, BridgeError> {
        let body = self
            .post_json(&format!("/session/{session_id}/title"), serde_json::json!({ "message": first_message }))
            .await?;
        let kind = body.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let value = body.get("value").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Ok(match kind {
            "title" => TitleResult::Title(value),
            _ => TitleResult::Unknown(value),
        })
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<AgentEvent> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("subscribe() called more than once on HttpAgentClient")
    }
}

/// Consumes the agent's Server-Sent-Events feed, reconnecting with a fixed
/// backoff on disconnect. Uses `Response::chunk` rather than
/// `bytes_stream` so no extra `reqwest` feature is needed for what is, in
/// spec §11 terms, just "an HTTP call shape".
async fn run_event_stream(url: String, tx: mpsc::UnboundedSender<AgentEvent>) {
    let client = reqwest::Client::new();
    loop {
        match client.get(&url).send().await {
            Ok(mut resp) => {
                let mut buf = String::new();
                loop {
                    match resp.chunk().await {
                        Ok(Some(bytes)) => {
                            buf.push_str(&String::from_utf8_lossy(&bytes));
                            while let Some(pos) = buf.find('\n') {
                                let line = buf[..pos].trim().to_string();
                                buf.drain(..=pos);
                                let Some(data) = line.strip_prefix("data:") else { continue };
                                let data = data.trim();
                                if data.is_empty() {
                                    continue;
                                }
                                if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
                                    let _ = tx.send(AgentEvent::from_json(value));
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "agent event stream read failed");
                            break;
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to connect to agent event stream"),
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let working_dir = cli.directory.unwrap_or_else(|| ".".to_string());
    let working_dir_path = Path::new(&working_dir);
    if !working_dir_path.exists() || !working_dir_path.is_dir() {
        anyhow::bail!("invalid working directory: {working_dir}");
    }
    let canonical_dir = working_dir_path
        .canonicalize()
        .map(|p| p.display().to_string())
        .unwrap_or(working_dir);

    let config = Config::load(Path::new(&canonical_dir)).context("failed to load configuration")?;

    let hostname = device::current_hostname();
    let device_name = device::device_id(config.device_name.as_deref(), &hostname, &canonical_dir);
    let sanitized_device_id = device::sanitize_for_filename(&device_name);

    let store: Option<Arc<SharedStore>> = if config.use_icloud_coordinator {
        match SharedStore::open(Path::new(&canonical_dir).join(".opencode").join("telegram-bridge")) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!(error = %e, "shared store unavailable, running single-instance");
                None
            }
        }
    } else {
        None
    };

    if let Some(store) = &store {
        let registry = Registry::new(store);
        let record = DeviceRecord {
            name: device_name.clone(),
            thread_id: config.thread_id,
            hostname: hostname.clone(),
            directory: canonical_dir.clone(),
            pid: std::process::id(),
            last_seen: now_millis(),
        };
        if let Err(e) = registry.write_device(&sanitized_device_id, &record).await {
            tracing::warn!(error = %e, "failed to write initial device record");
        }
    }

    let transport = Arc::new(TelegramTransport::new(&config.bot_token));
    if let Err(e) = transport
        .set_commands(vec![
            teloxide::types::BotCommand::new("connect", "Show the current session"),
            teloxide::types::BotCommand::new("model", "List or set the agent model"),
            teloxide::types::BotCommand::new("interrupt", "Abort the current turn"),
            teloxide::types::BotCommand::new("plan", "Ask the agent to plan"),
            teloxide::types::BotCommand::new("build", "Ask the agent to build"),
            teloxide::types::BotCommand::new("review", "Ask the agent to review"),
            teloxide::types::BotCommand::new("rename", "Rename the session topic"),
            teloxide::types::BotCommand::new("cap", "Run a shell command"),
            teloxide::types::BotCommand::new("ps", "List tracked processes"),
            teloxide::types::BotCommand::new("dev", "List known devices"),
            teloxide::types::BotCommand::new("use", "Make a device active"),
            teloxide::types::BotCommand::new("stop", "Stop a device's process"),
        ])
        .await
    {
        tracing::warn!(error = %e, "failed to set bot command menu");
    }

    let opencode_url = config.opencode_url.clone().unwrap_or_else(|| DEFAULT_OPENCODE_URL.to_string());
    let agent: Arc<dyn AgentClient> = HttpAgentClient::spawn(opencode_url);

    let pending = Arc::new(PendingRegistry::new());
    let bash_table = Arc::new(Mutex::new(BashTable::new()));

    let router = Arc::new(Router::new(
        transport.clone(),
        agent.clone(),
        pending.clone(),
        store.clone(),
        bash_table,
        device_name.clone(),
        hostname.clone(),
        canonical_dir.clone(),
        config.chat_id,
        config.thread_id,
        config.openai_api_key.clone(),
    ));

    let projector = Arc::new(StreamingProjector::new(
        transport.clone(),
        agent.clone(),
        pending.clone(),
        config.chat_id,
        config.thread_id,
        config.diff_viewer_url.clone(),
    ));

    let ingest = IngestLoop::new(
        transport.clone(),
        store.clone(),
        device_name.clone(),
        hostname.clone(),
        canonical_dir.clone(),
        std::process::id(),
        config.chat_id,
        config.thread_id,
        config.updates_url.clone(),
    );

    let shutdown = Arc::new(AtomicBool::new(false));

    let projector_handle = {
        let projector = projector.clone();
        let agent = agent.clone();
        tokio::spawn(async move {
            projector.run(agent.subscribe()).await;
        })
    };

    let ingest_handle = {
        let router = router.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            ingest.run(router, shutdown).await;
        })
    };

    tracing::info!(device = %device_name, directory = %canonical_dir, "bridge started");

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping");
    shutdown.store(true, Ordering::Relaxed);

    let _ = tokio::time::timeout(Duration::from_secs(5), ingest_handle).await;
    projector_handle.abort();

    Ok(())
}

/// Waits for SIGINT or SIGTERM (spec §12), grounded in
/// `ralph-telegram::daemon.rs`'s pairing of `tokio::signal::ctrl_c()` with
/// a `SignalKind::terminate()` listener around a shared shutdown flag.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
