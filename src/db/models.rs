use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::llm::types::{AnalysisResult, ChatMessage, ChatRole};

#[derive(Debug, Clone, FromRow)]
pub struct AnalysisRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub image_ref: String,
    pub soil_type: String,
    pub characteristics_json: String,
    pub recommendations_json: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAnalysis {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub image_ref: String,
    pub location: Option<String>,
    #[serde(flatten)]
    pub result: AnalysisResult,
}

impl TryFrom<AnalysisRow> for StoredAnalysis {
    type Error = serde_json::Error;

    fn try_from(row: AnalysisRow) -> Result<Self, Self::Error> {
        Ok(StoredAnalysis {
            id: row.id,
            created_at: row.created_at,
            image_ref: row.image_ref,
            location: row.location,
            result: AnalysisResult {
                soil_type: row.soil_type,
                characteristics: serde_json::from_str(&row.characteristics_json)?,
                recommendations: serde_json::from_str(&row.recommendations_json)?,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisInsert {
    pub image_ref: String,
    pub location: Option<String>,
    pub result: AnalysisResult,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatMessageRow {
    pub id: i64,
    pub analysis_id: i64,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChatMessage {
    pub id: i64,
    pub analysis_id: i64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ChatMessage,
}

impl StoredChatMessage {
    /// Rows with an unknown role are skipped rather than failing the history.
    pub fn from_row(row: ChatMessageRow) -> Option<Self> {
        let role = ChatRole::parse(&row.role)?;
        Some(StoredChatMessage {
            id: row.id,
            analysis_id: row.analysis_id,
            created_at: row.created_at,
            message: ChatMessage {
                role,
                content: row.content,
            },
        })
    }
}
