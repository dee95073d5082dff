use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};

use crate::config::{CHAT_SYSTEM_PROMPT, IMAGE_ANALYSIS_FORMAT_CONTRACT, IMAGE_ANALYSIS_PROMPT};
use crate::llm::types::{ChatMessage, ChatRole};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationProfile {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

pub const IMAGE_ANALYSIS_PROFILE: GenerationProfile = GenerationProfile {
    temperature: 0.4,
    max_output_tokens: 1024,
};

pub const CHAT_PROFILE: GenerationProfile = GenerationProfile {
    temperature: 0.8,
    max_output_tokens: 512,
};

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub structured_output: bool,
    pub response_language: String,
    pub history_limit: usize,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            structured_output: true,
            response_language: "Brazilian Portuguese".to_string(),
            history_limit: 20,
        }
    }
}

fn language_line(language: &str) -> String {
    format!("Please reply in {}.", language.trim())
}

pub fn analysis_response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "soilType": { "type": "STRING" },
            "characteristics": { "type": "ARRAY", "items": { "type": "STRING" } },
            "recommendations": { "type": "ARRAY", "items": { "type": "STRING" } }
        },
        "required": ["soilType", "characteristics", "recommendations"],
        "propertyOrdering": ["soilType", "characteristics", "recommendations"]
    })
}

fn image_prompt(options: &PromptOptions) -> String {
    let mut prompt = IMAGE_ANALYSIS_PROMPT.to_string();
    prompt.push_str("\n\n");
    prompt.push_str(&language_line(&options.response_language));
    if !options.structured_output {
        prompt.push_str("\n\n");
        prompt.push_str(IMAGE_ANALYSIS_FORMAT_CONTRACT);
    }
    prompt
}

pub fn build_image_analysis_payload(
    image_bytes: &[u8],
    mime_type: &str,
    options: &PromptOptions,
) -> Value {
    let mut generation_config = json!({
        "temperature": IMAGE_ANALYSIS_PROFILE.temperature,
        "maxOutputTokens": IMAGE_ANALYSIS_PROFILE.max_output_tokens,
    });
    if options.structured_output {
        if let Some(config) = generation_config.as_object_mut() {
            config.insert("responseMimeType".to_string(), json!("application/json"));
            config.insert("responseSchema".to_string(), analysis_response_schema());
        }
    }

    json!({
        "contents": [{
            "role": "user",
            "parts": [
                { "text": image_prompt(options) },
                {
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": general_purpose::STANDARD.encode(image_bytes)
                    }
                }
            ]
        }],
        "generationConfig": generation_config,
    })
}

/// Most recent `limit` turns, oldest first, as `User:` / `Assistant:` lines.
pub fn format_history(history: &[ChatMessage], limit: usize) -> String {
    let skip = history.len().saturating_sub(limit);
    history[skip..]
        .iter()
        .map(|message| {
            let label = match message.role {
                ChatRole::User => "User",
                ChatRole::Assistant => "Assistant",
            };
            format!("{}: {}", label, message.content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn chat_prompt(
    question: &str,
    soil_type: &str,
    characteristics: &[String],
    recommendations: &[String],
    history: &[ChatMessage],
    options: &PromptOptions,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(CHAT_SYSTEM_PROMPT);
    prompt.push_str("\n\nSOIL ANALYSIS:\n");
    prompt.push_str(&format!("- Type: {}\n", soil_type.trim()));
    prompt.push_str(&format!("- Characteristics: {}\n", characteristics.join(", ")));
    prompt.push_str(&format!("- Recommendations: {}\n", recommendations.join(", ")));

    let history_text = format_history(history, options.history_limit);
    if !history_text.is_empty() {
        prompt.push_str("\nCONVERSATION SO FAR:\n");
        prompt.push_str(&history_text);
        prompt.push('\n');
    }

    prompt.push_str(&format!("\nUser: {}\n\n", question.trim()));
    prompt.push_str(&language_line(&options.response_language));
    prompt
}

pub fn build_chat_payload(
    question: &str,
    soil_type: &str,
    characteristics: &[String],
    recommendations: &[String],
    history: &[ChatMessage],
    options: &PromptOptions,
) -> Value {
    let prompt = chat_prompt(
        question,
        soil_type,
        characteristics,
        recommendations,
        history,
        options,
    );
    json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "temperature": CHAT_PROFILE.temperature,
            "maxOutputTokens": CHAT_PROFILE.max_output_tokens,
        },
    })
}
