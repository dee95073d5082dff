use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub soil_type: String,
    pub characteristics: Vec<String>,
    pub recommendations: Vec<String>,
}

impl AnalysisResult {
    /// Returned when the model output could not be turned into a result.
    pub fn fallback() -> Self {
        AnalysisResult {
            soil_type: "Erro na análise".to_string(),
            characteristics: vec![
                "Imagem pouco nítida".to_string(),
                "Tente melhorar a nitidez".to_string(),
            ],
            recommendations: vec![
                "Tire outra foto".to_string(),
                "Evite sombra sobre o solo".to_string(),
                "Centralize o solo na imagem".to_string(),
            ],
        }
    }

    /// Returned when another image analysis is still in flight.
    pub fn busy() -> Self {
        AnalysisResult {
            soil_type: "Aguardando análise anterior".to_string(),
            characteristics: vec!["Espere alguns segundos".to_string()],
            recommendations: vec!["Evite enviar várias imagens ao mesmo tempo".to_string()],
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.soil_type.trim().is_empty()
            && !self.characteristics.is_empty()
            && !self.recommendations.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(ChatRole::User),
            "assistant" => Some(ChatRole::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

pub const CHAT_BUSY_REPLY: &str = "Calma! Ainda estou terminando a resposta anterior.";
pub const CHAT_APOLOGY_REPLY: &str =
    "Desculpe, ocorreu um erro ao processar sua pergunta. Por favor, tente novamente.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_camel_case_soil_type() {
        let value = serde_json::to_value(AnalysisResult::fallback()).unwrap();
        assert!(value.get("soilType").is_some());
        assert!(value.get("soil_type").is_none());
    }

    #[test]
    fn canned_results_satisfy_invariant() {
        assert!(AnalysisResult::fallback().is_complete());
        assert!(AnalysisResult::busy().is_complete());
    }

    #[test]
    fn chat_role_round_trips_through_text() {
        assert_eq!(ChatRole::parse("Assistant"), Some(ChatRole::Assistant));
        assert_eq!(ChatRole::parse(ChatRole::User.as_str()), Some(ChatRole::User));
        assert_eq!(ChatRole::parse("system"), None);
    }
}
