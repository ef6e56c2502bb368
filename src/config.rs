// Client configuration and token storage.
// Precedence: environment variables first, then the cached config file.
// The config is constructor-injected into the REST client and transports;
// nothing in the engine reads it from a global.

use anyhow::{anyhow, Result};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::PathBuf;

pub const ENV_API_BASE: &str = "MECACHAT_API_BASE";
pub const ENV_WS_BASE: &str = "MECACHAT_WS_BASE";
pub const ENV_TOKEN: &str = "MECACHAT_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// REST base, e.g. "https://api.example.com/api/v1/chat".
    pub api_base: String,
    /// WebSocket base, e.g. "wss://api.example.com".
    pub ws_base: String,
    /// Bearer token. None means not logged in; the engine fails fast with
    /// Unauthenticated rather than attempting anonymous connections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ChatConfig {
    pub fn new(api_base: &str, ws_base: &str, token: Option<&str>) -> Self {
        ChatConfig {
            api_base: api_base.trim_end_matches('/').to_string(),
            ws_base: ws_base.trim_end_matches('/').to_string(),
            token: token.map(|t| t.to_string()),
        }
    }

    /// Load from environment variables, falling back to the cached file.
    pub fn load() -> Result<Option<ChatConfig>> {
        if let (Ok(api), Ok(ws)) = (std::env::var(ENV_API_BASE), std::env::var(ENV_WS_BASE)) {
            let token = std::env::var(ENV_TOKEN).ok();
            return Ok(Some(ChatConfig::new(&api, &ws, token.as_deref())));
        }
        load_cached_config()
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.get() {
        return Ok(dir.clone());
    }
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("mecachat");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn save_config(config: &ChatConfig) -> Result<()> {
    let config_path = get_config_path()?;
    let file = File::create(config_path)?;
    serde_json::to_writer_pretty(file, config)?;

    info!("Config saved for {}", config.api_base);
    Ok(())
}

pub fn load_cached_config() -> Result<Option<ChatConfig>> {
    let config_path = get_config_path()?;

    if !config_path.exists() {
        return Ok(None);
    }

    let config_path_str = config_path.display().to_string();

    let mut file = File::open(config_path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let config = parse_config(&contents)?;
    info!("Loaded config for {} from {}", config.api_base, config_path_str);

    Ok(Some(config))
}

/// Parse a config file, re-normalizing the URLs. The file may have been
/// edited by hand, so trailing slashes cannot be assumed gone.
fn parse_config(contents: &str) -> Result<ChatConfig> {
    let raw: ChatConfig = serde_json::from_str(contents)?;
    Ok(ChatConfig::new(
        &raw.api_base,
        &raw.ws_base,
        raw.token.as_deref(),
    ))
}

static CONFIG_DIR_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Point config storage at a different directory (tests use a tempdir).
pub fn set_config_dir_override(dir: PathBuf) {
    let _ = CONFIG_DIR_OVERRIDE.set(dir);
}

fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir_override(dir.path().to_path_buf());

        let config = ChatConfig::new(
            "https://api.example.com/api/v1/chat/",
            "wss://api.example.com/",
            Some("tok-123"),
        );
        // Trailing slashes are normalized away at construction.
        assert_eq!(config.api_base, "https://api.example.com/api/v1/chat");
        assert_eq!(config.ws_base, "wss://api.example.com");

        save_config(&config).unwrap();
        let loaded = load_cached_config().unwrap().expect("config file present");
        assert_eq!(loaded.api_base, config.api_base);
        assert_eq!(loaded.token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn hand_edited_trailing_slashes_are_normalized_on_load() {
        let contents = r#"{
            "api_base": "https://api.example.com/api/v1/chat/",
            "ws_base": "wss://api.example.com/",
            "token": "tok"
        }"#;
        let config = parse_config(contents).unwrap();
        assert_eq!(config.api_base, "https://api.example.com/api/v1/chat");
        assert_eq!(config.ws_base, "wss://api.example.com");
        assert_eq!(config.token.as_deref(), Some("tok"));
    }
}
