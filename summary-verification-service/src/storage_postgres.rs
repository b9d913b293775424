use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions, types::Json};
use tracing::info;

use crate::{
    error::StoreError,
    models::{Document, DocumentPatch, FeedbackEntry, VerificationStatus},
    storage::DocumentStore,
};

// The ingestion side owns `articles`; only the verification columns are ensured here.
const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS articles (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        category TEXT,
        summary TEXT
    )"#,
    "ALTER TABLE articles ADD COLUMN IF NOT EXISTS verification_status TEXT NOT NULL DEFAULT 'pending'",
    "ALTER TABLE articles ADD COLUMN IF NOT EXISTS attempt_count INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE articles ADD COLUMN IF NOT EXISTS feedback_history JSONB NOT NULL DEFAULT '[]'::jsonb",
    "ALTER TABLE articles ADD COLUMN IF NOT EXISTS version BIGINT NOT NULL DEFAULT 0",
    "ALTER TABLE articles ADD COLUMN IF NOT EXISTS updated_at TIMESTAMPTZ NOT NULL DEFAULT now()",
];

#[derive(sqlx::FromRow)]
struct ArticleRow {
    id: String,
    title: String,
    content: String,
    category: Option<String>,
    summary: Option<String>,
    verification_status: String,
    attempt_count: i32,
    feedback_history: Json<Vec<FeedbackEntry>>,
    version: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ArticleRow> for Document {
    type Error = StoreError;

    fn try_from(row: ArticleRow) -> Result<Self, Self::Error> {
        let verification_status = VerificationStatus::parse(&row.verification_status)
            .ok_or_else(|| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("unknown verification_status {:?}", row.verification_status),
            })?;
        let attempt_count = u32::try_from(row.attempt_count).map_err(|_| StoreError::Corrupt {
            id: row.id.clone(),
            reason: format!("negative attempt_count {}", row.attempt_count),
        })?;

        Ok(Document {
            id: row.id,
            title: row.title,
            source_content: row.content,
            category: row.category,
            summary: row.summary,
            verification_status,
            attempt_count,
            feedback_history: row.feedback_history.0,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}

fn attempt_count_column(id: &str, count: u32) -> Result<i32, StoreError> {
    i32::try_from(count).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("attempt_count {} does not fit the INTEGER column", count),
    })
}

/// PostgreSQL implementation of DocumentStore over the `articles` table
pub struct PostgresDocumentStore {
    pool: PgPool,
}

impl PostgresDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!("Connected to PostgreSQL document store");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, ArticleRow>(
            "SELECT id, title, content, category, summary, verification_status, \
             attempt_count, feedback_history, version, updated_at \
             FROM articles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Document::try_from).transpose()
    }

    async fn update_document(
        &self,
        id: &str,
        expected_version: i64,
        patch: DocumentPatch,
    ) -> Result<i64, StoreError> {
        let attempt_count = patch
            .attempt_count
            .map(|count| attempt_count_column(id, count))
            .transpose()?;

        let new_version: Option<i64> = sqlx::query_scalar(
            "UPDATE articles SET \
               summary = COALESCE($3, summary), \
               verification_status = COALESCE($4, verification_status), \
               attempt_count = COALESCE($5, attempt_count), \
               feedback_history = COALESCE($6, feedback_history), \
               version = version + 1, \
               updated_at = now() \
             WHERE id = $1 AND version = $2 \
             RETURNING version",
        )
        .bind(id)
        .bind(expected_version)
        .bind(patch.summary)
        .bind(patch.verification_status.map(|s| s.as_str()))
        .bind(attempt_count)
        .bind(patch.feedback_history.map(Json))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(version) = new_version {
            return Ok(version);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT version FROM articles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }
}
