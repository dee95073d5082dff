use anyhow::{anyhow, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::models::{
    AnalysisInsert, AnalysisRow, ChatMessageRow, StoredAnalysis, StoredChatMessage,
};
use crate::llm::types::ChatRole;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        // Every in-memory connection is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS analyses (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                created_at TEXT NOT NULL,\
                image_ref TEXT NOT NULL,\
                soil_type TEXT NOT NULL,\
                characteristics_json TEXT NOT NULL,\
                recommendations_json TEXT NOT NULL,\
                location TEXT\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chat_messages (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                analysis_id INTEGER NOT NULL,\
                role TEXT NOT NULL,\
                content TEXT NOT NULL,\
                created_at TEXT NOT NULL,\
                FOREIGN KEY(analysis_id) REFERENCES analyses(id)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_created_at ON analyses(created_at);")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_analysis_id ON chat_messages(analysis_id);",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    pub async fn insert_analysis(&self, insert: &AnalysisInsert) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO analyses (created_at, image_ref, soil_type, characteristics_json, recommendations_json, location) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now())
        .bind(&insert.image_ref)
        .bind(&insert.result.soil_type)
        .bind(serde_json::to_string(&insert.result.characteristics)?)
        .bind(serde_json::to_string(&insert.result.recommendations)?)
        .bind(insert.location.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_analysis(&self, id: i64) -> Result<Option<StoredAnalysis>> {
        let row = sqlx::query_as::<_, AnalysisRow>(
            "SELECT id, created_at, image_ref, soil_type, characteristics_json, recommendations_json, location \
             FROM analyses WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            StoredAnalysis::try_from(row)
                .map_err(|err| anyhow!("Stored analysis {id} has invalid JSON columns: {err}"))
        })
        .transpose()
    }

    /// Newest first.
    pub async fn list_analyses(&self, limit: i64) -> Result<Vec<StoredAnalysis>> {
        let rows = sqlx::query_as::<_, AnalysisRow>(
            "SELECT id, created_at, image_ref, soil_type, characteristics_json, recommendations_json, location \
             FROM analyses ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().filter_map(decode_listed).collect())
    }

    /// Newest first, keeping analyses whose soil type or location contains
    /// `query` regardless of case. A blank query matches everything.
    pub async fn search_analyses(&self, query: &str, limit: i64) -> Result<Vec<StoredAnalysis>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list_analyses(limit).await;
        }

        // SQLite's lower() only folds ASCII, so matching happens here.
        let rows = sqlx::query_as::<_, AnalysisRow>(
            "SELECT id, created_at, image_ref, soil_type, characteristics_json, recommendations_json, location \
             FROM analyses ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter(|row| matches_search(row, &needle))
            .filter_map(decode_listed)
            .take(usize::try_from(limit.max(0)).unwrap_or(usize::MAX))
            .collect())
    }

    pub async fn insert_chat_message(
        &self,
        analysis_id: i64,
        role: ChatRole,
        content: &str,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO chat_messages (analysis_id, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(analysis_id)
        .bind(role.as_str())
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Oldest first, ready to be passed as chat history.
    pub async fn chat_history(&self, analysis_id: i64) -> Result<Vec<StoredChatMessage>> {
        let rows = sqlx::query_as::<_, ChatMessageRow>(
            "SELECT id, analysis_id, role, content, created_at \
             FROM chat_messages WHERE analysis_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(StoredChatMessage::from_row)
            .collect())
    }
}

fn matches_search(row: &AnalysisRow, needle: &str) -> bool {
    row.soil_type.to_lowercase().contains(needle)
        || row
            .location
            .as_deref()
            .is_some_and(|location| location.to_lowercase().contains(needle))
}

fn decode_listed(row: AnalysisRow) -> Option<StoredAnalysis> {
    let id = row.id;
    match StoredAnalysis::try_from(row) {
        Ok(analysis) => Some(analysis),
        Err(err) => {
            warn!("Skipping analysis {} with invalid JSON columns: {}", id, err);
            None
        }
    }
}
