//! Layered configuration loader (spec §6.3).
//!
//! Precedence, later overrides earlier: `$HOME/.config/<app>/telegram.json`
//! -> `<working-dir>/.opencode/telegram.json` -> environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub const APP_DIR_NAME: &str = "opencode-telegram-bridge";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    chat_id: Option<i64>,
    #[serde(default)]
    thread_id: Option<i64>,
    #[serde(default)]
    updates_url: Option<String>,
    #[serde(default)]
    send_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub updates_url: Option<String>,
    pub send_url: Option<String>,
    pub use_icloud_coordinator: bool,
    pub device_name: Option<String>,
    pub opencode_url: Option<String>,
    pub openai_api_key: Option<String>,
    pub diff_viewer_url: Option<String>,
}

impl Config {
    /// Loads and validates config from the layered sources. Returns
    /// `FatalConfig` if `bot_token`/`chat_id` end up unset after layering.
    pub fn load(working_dir: &Path) -> Result<Config, BridgeError> {
        let mut merged = ConfigFile::default();

        if let Some(home_config) = home_config_path() {
            merge_file(&mut merged, &home_config);
        }
        let project_config = working_dir.join(".opencode").join("telegram.json");
        merge_file(&mut merged, &project_config);

        apply_env_overrides(&mut merged);

        let bot_token = merged
            .bot_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::FatalConfig("missing botToken".into()))?;
        let chat_id = merged
            .chat_id
            .ok_or_else(|| BridgeError::FatalConfig("missing chatId".into()))?;

        let use_icloud_coordinator = std::env::var("USE_ICLOUD_COORDINATOR")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        Ok(Config {
            bot_token,
            chat_id,
            thread_id: merged.thread_id,
            updates_url: merged.updates_url,
            send_url: merged.send_url,
            use_icloud_coordinator,
            device_name: std::env::var("DEVICE_NAME").ok(),
            opencode_url: std::env::var("OPENCODE_URL").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            diff_viewer_url: std::env::var("DIFF_VIEWER_URL").ok(),
        })
    }
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join(APP_DIR_NAME).join("telegram.json"))
}

fn merge_file(target: &mut ConfigFile, path: &Path) {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return;
    };
    let Ok(layer) = serde_json::from_str::<ConfigFile>(&contents) else {
        tracing::warn!(path = %path.display(), "failed to parse config file, ignoring");
        return;
    };
    merge_layer(target, layer);
}

fn merge_layer(target: &mut ConfigFile, layer: ConfigFile) {
    if layer.bot_token.is_some() {
        target.bot_token = layer.bot_token;
    }
    if layer.chat_id.is_some() {
        target.chat_id = layer.chat_id;
    }
    if layer.thread_id.is_some() {
        target.thread_id = layer.thread_id;
    }
    if layer.updates_url.is_some() {
        target.updates_url = layer.updates_url;
    }
    if layer.send_url.is_some() {
        target.send_url = layer.send_url;
    }
}

fn apply_env_overrides(target: &mut ConfigFile) {
    if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
        target.bot_token = Some(v);
    }
    if let Ok(v) = std::env::var("TELEGRAM_CHAT_ID") {
        if let Ok(parsed) = v.parse() {
            target.chat_id = Some(parsed);
        }
    }
    if let Ok(v) = std::env::var("TELEGRAM_THREAD_ID") {
        if let Ok(parsed) = v.parse() {
            target.thread_id = Some(parsed);
        }
    }
    if let Ok(v) = std::env::var("TELEGRAM_UPDATES_URL") {
        target.updates_url = Some(v);
    }
    if let Ok(v) = std::env::var("TELEGRAM_SEND_URL") {
        target.send_url = Some(v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_json(dir: &Path, rel: &str, json: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(json.as_bytes()).unwrap();
    }

    #[test]
    fn project_config_overrides_nothing_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cf = ConfigFile::default();
        merge_file(&mut cf, &dir.path().join("missing.json"));
        assert!(cf.bot_token.is_none());
    }

    #[test]
    fn env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        write_json(
            dir.path(),
            ".opencode/telegram.json",
            r#"{"botToken":"from-file","chatId":1}"#,
        );
        std::env::set_var("TELEGRAM_BOT_TOKEN", "from-env");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        std::env::remove_var("TELEGRAM_THREAD_ID");
        std::env::remove_var("TELEGRAM_UPDATES_URL");
        std::env::remove_var("TELEGRAM_SEND_URL");
        std::env::remove_var("USE_ICLOUD_COORDINATOR");
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.bot_token, "from-env");
        assert_eq!(cfg.chat_id, 1);
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
    }

    #[test]
    fn missing_bot_token_is_fatal_config() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var("TELEGRAM_BOT_TOKEN");
        std::env::remove_var("TELEGRAM_CHAT_ID");
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, BridgeError::FatalConfig(_)));
    }
}
