use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::AssistantSeed;
use crate::models::Assistant;
use crate::store::Store;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assistants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            system_prompt TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            assistant_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            source_kind TEXT NOT NULL,
            source_url TEXT,
            mime_type TEXT,
            file_size INTEGER,
            original_text TEXT NOT NULL,
            chunks INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'processing',
            uploaded_at INTEGER NOT NULL,
            FOREIGN KEY (assistant_id) REFERENCES assistants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chat_sessions (
            session_id TEXT PRIMARY KEY,
            assistant_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (assistant_id) REFERENCES assistants(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // rowid breaks ties between messages written in the same millisecond.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            retrieved_passages_json TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (session_id) REFERENCES chat_sessions(session_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_assistant ON documents(assistant_id, uploaded_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_assistant ON chat_sessions(assistant_id, updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Insert or refresh the configured assistants. Existing rows keep their
/// `created_at`.
pub async fn seed_assistants(store: &dyn Store, seeds: &[AssistantSeed]) -> Result<usize> {
    let now = chrono::Utc::now().timestamp_millis();
    for seed in seeds {
        let assistant = Assistant {
            id: seed.id.clone(),
            name: seed.name.clone(),
            description: seed.description.clone(),
            system_prompt: seed.system_prompt.clone(),
            created_at: now,
        };
        store.upsert_assistant(&assistant).await?;
        tracing::info!(assistant = %seed.id, "seeded assistant");
    }
    Ok(seeds.len())
}
