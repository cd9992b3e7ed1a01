//! Daemon settings from `HUDDLE_*` environment variables.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use huddle_sync_engine::SyncEngineConfig;

const DEFAULT_DATA_DIR: &str = "./huddle-data";
const STREAM_PATH: &str = "/realtime/v1/websocket";

#[derive(Debug, Clone)]
pub struct SyncdConfig {
    pub api_url: String,
    pub stream_url: String,
    pub auth_url: String,
    pub api_key: Option<String>,
    pub refresh_token: String,
    pub user_id: String,
    pub data_dir: PathBuf,
    pub db_key: Option<String>,
    pub engine: SyncEngineConfig,
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
}

/// `http(s)://host` becomes `ws(s)://host/realtime/v1/websocket`.
fn default_stream_url(api_url: &str) -> String {
    let base = if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_url.to_string()
    };
    format!("{}{}", base, STREAM_PATH)
}

impl SyncdConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| clean(lookup(key));
        let require = |key: &str| {
            var(key).ok_or_else(|| anyhow!("{} not configured. Sync is disabled.", key))
        };

        let api_url = require("HUDDLE_API_URL")?;
        let engine = match var("HUDDLE_ENGINE_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("read engine config {}", path))?;
                serde_json::from_str(&raw).with_context(|| format!("parse engine config {}", path))?
            }
            None => SyncEngineConfig::default(),
        };

        Ok(Self {
            stream_url: var("HUDDLE_STREAM_URL").unwrap_or_else(|| default_stream_url(&api_url)),
            auth_url: var("HUDDLE_AUTH_URL").unwrap_or_else(|| api_url.clone()),
            api_key: var("HUDDLE_API_KEY"),
            refresh_token: lookup("HUDDLE_REFRESH_TOKEN")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("HUDDLE_REFRESH_TOKEN not configured. Please sign in first."))?,
            user_id: require("HUDDLE_USER_ID")?,
            data_dir: PathBuf::from(
                lookup("HUDDLE_DATA_DIR")
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            db_key: lookup("HUDDLE_DB_KEY").filter(|v| !v.is_empty()),
            api_url,
            engine,
        })
    }
}
