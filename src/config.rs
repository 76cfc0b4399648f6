use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_news_enabled")]
    pub enabled: bool,
    #[serde(default = "default_news_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
    #[serde(default)]
    pub target_group_ids: Vec<i64>,
}

fn default_news_enabled() -> bool {
    true
}

fn default_news_hour() -> u32 {
    8
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_news_enabled(),
            hour: default_news_hour(),
            minute: 0,
            target_group_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Persisted state locations
    #[serde(default = "default_user_store_path")]
    pub user_store_path: String,
    #[serde(default = "default_roles_path")]
    pub roles_path: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub passage_seed_path: Option<String>,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub deepseek_api_key: Option<String>,

    // Reply handling
    #[serde(default = "default_reply_timeout_secs")]
    pub reply_timeout_secs: u64,
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,

    // Admin
    #[serde(default)]
    pub admin_user_ids: Vec<i64>,

    // OneBot transport
    #[serde(default = "default_onebot_ws_url")]
    pub onebot_ws_url: String,
    #[serde(default)]
    pub bot_self_id: i64,

    // News report
    #[serde(default)]
    pub rss_feeds: HashMap<String, String>,
    #[serde(default = "default_report_title")]
    pub report_title: String,
    #[serde(default = "default_report_format")]
    pub report_format: String,
    #[serde(default = "default_max_items_per_feed")]
    pub max_items_per_feed: usize,
    #[serde(default = "default_max_total_items")]
    pub max_total_items: usize,
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_sources: Vec<String>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("reverie"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn default_user_store_path() -> String {
    data_dir().join("users.json").to_string_lossy().into_owned()
}

fn default_roles_path() -> String {
    data_dir().join("roles.json").to_string_lossy().into_owned()
}

fn default_database_path() -> String {
    data_dir().join("reverie.db").to_string_lossy().into_owned()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "ollama/qwen2.5".to_string()
}

fn default_reply_timeout_secs() -> u64 {
    120
}

fn default_max_chunk_len() -> usize {
    3500
}

fn default_onebot_ws_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}

fn default_report_title() -> String {
    "Daily tech digest".to_string()
}

fn default_report_format() -> String {
    "text".to_string()
}

fn default_max_items_per_feed() -> usize {
    3
}

fn default_max_total_items() -> usize {
    15
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            user_store_path: default_user_store_path(),
            roles_path: default_roles_path(),
            database_path: default_database_path(),
            passage_seed_path: None,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            deepseek_api_key: None,
            reply_timeout_secs: default_reply_timeout_secs(),
            max_chunk_len: default_max_chunk_len(),
            admin_user_ids: Vec::new(),
            onebot_ws_url: default_onebot_ws_url(),
            bot_self_id: 0,
            rss_feeds: HashMap::new(),
            report_title: default_report_title(),
            report_format: default_report_format(),
            max_items_per_feed: default_max_items_per_feed(),
            max_total_items: default_max_total_items(),
            include_keywords: Vec::new(),
            exclude_sources: Vec::new(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("reverie.toml")
    }

    /// Load config from reverie.toml (next to executable). A missing or
    /// malformed file never aborts startup.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<BotConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Apply environment-variable overrides on top of whatever was loaded.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("REVERIE_LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("REVERIE_LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(key) = env::var("REVERIE_LLM_API_KEY") {
            self.llm_api_key = Some(key);
        }

        if let Ok(key) = env::var("DEEPSEEK_API_KEY") {
            self.deepseek_api_key = Some(key);
        }

        if let Ok(url) = env::var("ONEBOT_WS_URL") {
            self.onebot_ws_url = url;
        }

        if let Ok(id) = env::var("BOT_SELF_ID") {
            if let Ok(id) = id.parse() {
                self.bot_self_id = id;
            }
        }

        if let Ok(ids) = env::var("ADMIN_USER_IDS") {
            let parsed: Vec<i64> = ids
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.admin_user_ids = parsed;
            }
        }

        // "name|url;name|url" pairs, matching the legacy deployment format.
        if let Ok(feeds) = env::var("RSS_FEEDS") {
            for entry in feeds.split(';') {
                if let Some((name, url)) = entry.split_once('|') {
                    if !name.trim().is_empty() && !url.trim().is_empty() {
                        self.rss_feeds
                            .insert(name.trim().to_string(), url.trim().to_string());
                    }
                }
            }
        }

        if let Ok(secs) = env::var("REVERIE_REPLY_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.reply_timeout_secs = secs;
            }
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_defaults() {
        let config: BotConfig = toml::from_str("llm_model = \"deepseek-chat\"").unwrap();
        assert_eq!(config.llm_model, "deepseek-chat");
        assert_eq!(config.reply_timeout_secs, default_reply_timeout_secs());
        assert_eq!(config.max_chunk_len, default_max_chunk_len());
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.hour, 8);
    }

    #[test]
    fn schedule_section_parses() {
        let config: BotConfig = toml::from_str(
            "[schedule]\nenabled = false\nhour = 20\nminute = 30\ntarget_group_ids = [42]\n",
        )
        .unwrap();
        assert!(!config.schedule.enabled);
        assert_eq!(config.schedule.hour, 20);
        assert_eq!(config.schedule.minute, 30);
        assert_eq!(config.schedule.target_group_ids, vec![42]);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let mut config = BotConfig::default();
        config
            .rss_feeds
            .insert("hn".to_string(), "https://example.com/rss".to_string());
        config.admin_user_ids = vec![1, 2];

        let text = toml::to_string_pretty(&config).unwrap();
        let back: BotConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.rss_feeds["hn"], "https://example.com/rss");
        assert_eq!(back.admin_user_ids, vec![1, 2]);
    }
}
