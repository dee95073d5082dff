use std::env;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub log_dir: String,
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub gemini_structured_output: bool,
    pub gemini_max_attempts: u32,
    pub gemini_retry_base_delay_ms: u64,
    pub gemini_retry_jitter_ms: u64,
    pub response_language: String,
    pub chat_history_limit: usize,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn normalize_base_url(value: &str) -> Result<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(anyhow!(
            "GEMINI_BASE_URL must be an http(s) URL, got '{}'",
            value
        ));
    }
    Ok(trimmed.to_string())
}

fn normalize_max_attempts(value: u32) -> u32 {
    if value == 0 {
        warn!("GEMINI_MAX_ATTEMPTS=0 is not allowed; using a single attempt.");
        return 1;
    }
    value
}

impl Config {
    pub fn load() -> Result<Self> {
        let gemini_base_url = normalize_base_url(&env_string(
            "GEMINI_BASE_URL",
            "https://generativelanguage.googleapis.com/v1beta",
        ))?;

        let mut response_language = env_string("RESPONSE_LANGUAGE", "Brazilian Portuguese");
        if response_language.trim().is_empty() {
            response_language = "Brazilian Portuguese".to_string();
        }

        Ok(Config {
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            log_dir: env_string("LOG_DIR", "logs"),
            database_url: env_string("DATABASE_URL", "sqlite://terrasense.db?mode=rwc"),
            gemini_api_key: env_string("GEMINI_API_KEY", "").trim().to_string(),
            gemini_base_url,
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.0-flash"),
            gemini_structured_output: env_bool("GEMINI_STRUCTURED_OUTPUT", true),
            gemini_max_attempts: normalize_max_attempts(env_u32("GEMINI_MAX_ATTEMPTS", 3)),
            gemini_retry_base_delay_ms: env_u64("GEMINI_RETRY_BASE_DELAY_MS", 800),
            gemini_retry_jitter_ms: env_u64("GEMINI_RETRY_JITTER_MS", 400),
            response_language: response_language.trim().to_string(),
            chat_history_limit: env_usize("CHAT_HISTORY_LIMIT", 20),
        })
    }
}

pub const IMAGE_ANALYSIS_PROMPT: &str = "You are a soil analysis specialist helping smallholder family farmers. Analyze the soil shown in this photo and provide:\n\n1. SOIL TYPE: identify the main type (Argiloso, Arenoso, Humoso or Siltoso).\n2. CHARACTERISTICS: list 4 to 5 visually identifiable characteristics.\n3. RECOMMENDATIONS: give 4 to 6 practical planting and management recommendations.\n\nKeep every item short and written in plain words a farmer can act on.";

pub const IMAGE_ANALYSIS_FORMAT_CONTRACT: &str = "Return ONLY a raw JSON object, with no Markdown and no commentary, in EXACTLY this format:\n{\n  \"soilType\": \"type\",\n  \"characteristics\": [\"c1\", \"c2\", \"c3\", \"c4\"],\n  \"recommendations\": [\"r1\", \"r2\", \"r3\", \"r4\"]\n}";

pub const CHAT_SYSTEM_PROMPT: &str = "You are a friendly agronomist answering follow-up questions from a smallholder farmer about one specific soil analysis.\n\nGuidelines:\n1. Base every answer on the soil analysis below and the conversation so far.\n2. Answer simply and practically, as if talking to the farmer in person.\n3. If the question is not about this soil, farming, or the analysis, say so briefly and steer the conversation back to the soil analysis.\n4. Keep answers short unless the farmer asks for detail.";
