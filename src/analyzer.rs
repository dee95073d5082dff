use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::AnalysisError;
use crate::llm::guard::{CallKind, ConcurrencyGuard};
use crate::llm::media::ImageInput;
use crate::llm::normalize::{extract_text, parse_analysis, parse_envelope};
use crate::llm::request::{build_chat_payload, build_image_analysis_payload, PromptOptions};
use crate::llm::retry::{
    redact_secret, send_with_retry, ProviderRequest, ReqwestTransport, RetryPolicy, Transport,
};
use crate::llm::types::{AnalysisResult, ChatMessage, CHAT_APOLOGY_REPLY, CHAT_BUSY_REPLY};
use crate::utils::timing::log_llm_timing;

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub prompt: PromptOptions,
}

impl GeminiSettings {
    pub fn from_config(config: &Config) -> Self {
        GeminiSettings {
            base_url: config.gemini_base_url.clone(),
            model: config.gemini_model.clone(),
            api_key: config.gemini_api_key.clone(),
            prompt: PromptOptions {
                structured_output: config.gemini_structured_output,
                response_language: config.response_language.clone(),
                history_limit: config.chat_history_limit,
            },
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model.trim()
        )
    }
}

fn truncate_for_log(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let truncated: String = value.chars().take(limit).collect();
    format!("{truncated}... (truncated)")
}

fn summarize_payload(payload: &Value) -> Value {
    let parts = payload
        .pointer("/contents/0/parts")
        .and_then(|value| value.as_array())
        .map(|parts| {
            parts
                .iter()
                .map(|part| {
                    if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
                        json!({ "text": truncate_for_log(text, 200) })
                    } else if let Some(inline_data) = part.get("inlineData") {
                        let mime_type = inline_data
                            .get("mimeType")
                            .and_then(|value| value.as_str())
                            .unwrap_or("unknown");
                        let data_len = inline_data
                            .get("data")
                            .and_then(|value| value.as_str())
                            .map(|value| value.len())
                            .unwrap_or(0);
                        json!({ "inlineData": { "mimeType": mime_type, "dataLen": data_len } })
                    } else {
                        json!({ "unknownPart": true })
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut summary = Map::new();
    summary.insert("parts".to_string(), Value::Array(parts));
    if let Some(config) = payload.get("generationConfig") {
        let mut config = config.clone();
        if let Some(object) = config.as_object_mut() {
            if object.remove("responseSchema").is_some() {
                object.insert("responseSchema".to_string(), json!("<schema>"));
            }
        }
        summary.insert("generationConfig".to_string(), config);
    }
    Value::Object(summary)
}

fn summarize_error_body(body: &str) -> (Option<String>, String) {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return (None, "empty response body".to_string());
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        let message = value
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|v| v.to_string())
            .or_else(|| {
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(|v| v.to_string())
            });
        return (message, truncate_for_log(&value.to_string(), 2000));
    }

    (None, truncate_for_log(trimmed, 2000))
}

/// Entry point used by the surrounding application. Each instance owns its
/// own concurrency latches.
pub struct SoilAnalyzer {
    settings: GeminiSettings,
    retry: RetryPolicy,
    transport: Arc<dyn Transport>,
    guard: ConcurrencyGuard,
}

impl SoilAnalyzer {
    pub fn new(settings: GeminiSettings, retry: RetryPolicy, transport: Arc<dyn Transport>) -> Self {
        SoilAnalyzer {
            settings,
            retry,
            transport,
            guard: ConcurrencyGuard::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        if config.gemini_api_key.is_empty() {
            warn!("GEMINI_API_KEY is not set; Gemini calls will be rejected by the provider.");
        }
        let retry = RetryPolicy::new(
            config.gemini_max_attempts,
            Duration::from_millis(config.gemini_retry_base_delay_ms),
            Duration::from_millis(config.gemini_retry_jitter_ms),
        );
        Self::new(
            GeminiSettings::from_config(config),
            retry,
            Arc::new(ReqwestTransport::default()),
        )
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Classifies a soil photo. Unusable model output resolves to
    /// [`AnalysisResult::fallback`]; only transport and HTTP failures are
    /// returned as errors.
    pub async fn analyze_image(&self, image: ImageInput) -> Result<AnalysisResult, AnalysisError> {
        let Some(_permit) = self.guard.enter(CallKind::ImageAnalysis) else {
            warn!("Image analysis already in progress; returning placeholder result");
            return Ok(AnalysisResult::busy());
        };

        let captured = match image.into_captured() {
            Ok(captured) => captured,
            Err(err) => {
                warn!("Rejecting soil image before calling Gemini: {}", err);
                return Ok(AnalysisResult::fallback());
            }
        };

        let payload =
            build_image_analysis_payload(&captured.bytes, &captured.mime_type, &self.settings.prompt);
        let metadata = json!({
            "mimeType": captured.mime_type,
            "imageBytes": captured.bytes.len(),
            "structuredOutput": self.settings.prompt.structured_output,
        });

        let outcome = log_llm_timing(
            "gemini",
            &self.settings.model,
            CallKind::ImageAnalysis.label(),
            Some(metadata),
            || self.generate(payload),
        )
        .await
        .and_then(|text| parse_analysis(&text));

        match outcome {
            Ok(result) => {
                info!(
                    "Soil analysis completed: soil_type={} characteristics={} recommendations={}",
                    result.soil_type,
                    result.characteristics.len(),
                    result.recommendations.len()
                );
                Ok(result)
            }
            Err(err) if err.is_recoverable() => {
                warn!("Gemini soil analysis unusable, returning fallback: {}", err);
                Ok(AnalysisResult::fallback())
            }
            Err(err) => Err(err),
        }
    }

    /// Answers a follow-up question about one analysis. `history` must be in
    /// chronological order; it is not reordered here.
    pub async fn ask_follow_up(
        &self,
        question: &str,
        soil_type: &str,
        characteristics: &[String],
        recommendations: &[String],
        history: &[ChatMessage],
    ) -> Result<String, AnalysisError> {
        let Some(_permit) = self.guard.enter(CallKind::Chat) else {
            warn!("Chat reply already in progress; returning busy reply");
            return Ok(CHAT_BUSY_REPLY.to_string());
        };

        let payload = build_chat_payload(
            question,
            soil_type,
            characteristics,
            recommendations,
            history,
            &self.settings.prompt,
        );
        let metadata = json!({
            "historyTurns": history.len().min(self.settings.prompt.history_limit),
            "questionChars": question.chars().count(),
        });

        let outcome = log_llm_timing(
            "gemini",
            &self.settings.model,
            CallKind::Chat.label(),
            Some(metadata),
            || self.generate(payload),
        )
        .await;

        match outcome {
            Ok(reply) => Ok(reply),
            Err(err) if err.is_recoverable() => {
                warn!("Gemini chat reply unusable, returning apology: {}", err);
                Ok(CHAT_APOLOGY_REPLY.to_string())
            }
            Err(err) => Err(err),
        }
    }

    async fn generate(&self, payload: Value) -> Result<String, AnalysisError> {
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                target: "llm.gemini",
                model = %self.settings.model,
                payload = %summarize_payload(&payload)
            );
        }

        let request = ProviderRequest {
            method: Method::POST,
            url: self.settings.endpoint(),
            headers: vec![("x-goog-api-key".to_string(), self.settings.api_key.clone())],
            body: payload,
        };
        let response = send_with_retry(
            self.transport.as_ref(),
            &request,
            &self.retry,
            &self.settings.api_key,
        )
        .await?;

        if !response.status.is_success() {
            let (message, body_summary) = summarize_error_body(&response.body);
            let body_summary = redact_secret(&body_summary, &self.settings.api_key);
            warn!(
                "Gemini API error: status={}, body={}",
                response.status, body_summary
            );
            return Err(AnalysisError::Provider {
                status: response.status.as_u16(),
                message: message.unwrap_or(body_summary),
            });
        }

        let envelope = parse_envelope(&response.body)?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!(
                target: "llm.gemini",
                candidates = envelope.candidate_count(),
                body = %truncate_for_log(&response.body, 400)
            );
        }
        extract_text(&envelope)
    }
}
