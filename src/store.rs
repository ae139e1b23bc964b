//! Relational records: assistants, documents, sessions and messages.
//!
//! The [`Store`] trait is what the ingestion pipeline, query engine and HTTP
//! server see. [`SqliteStore`] is the only implementation; tests run it
//! against an in-memory database.
//!
//! Timestamps are Unix milliseconds.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{
    Assistant, AssistantOverview, ChatSession, Document, DocumentStatus, DocumentSummary, Message,
    RetrievedPassage, SessionSummary,
};

/// Characters of the first message used as a session title.
const TITLE_CHARS: usize = 50;
const UNTITLED_SESSION: &str = "New Chat";

/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_assistant`](Store::get_assistant) | Load one assistant |
/// | [`upsert_assistant`](Store::upsert_assistant) | Seed or refresh an assistant |
/// | [`create_document`](Store::create_document) | Record a document in `processing` |
/// | [`set_document_status`](Store::set_document_status) | Move a document to `completed` or `failed` |
/// | [`create_session`](Store::create_session) | Open a chat session |
/// | [`append_exchange`](Store::append_exchange) | Write a user/assistant message pair atomically |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>>;

    async fn upsert_assistant(&self, assistant: &Assistant) -> Result<()>;

    async fn list_assistants(&self) -> Result<Vec<Assistant>>;

    /// Every assistant with its completed documents and counts.
    async fn assistant_overviews(&self) -> Result<Vec<AssistantOverview>>;

    async fn create_document(&self, doc: &Document) -> Result<()>;

    async fn set_document_status(&self, id: &str, status: DocumentStatus, chunks: i64)
        -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documents of one assistant, newest first.
    async fn list_documents(&self, assistant_id: &str) -> Result<Vec<Document>>;

    async fn create_session(&self, session: &ChatSession) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>>;

    /// Sessions of one assistant, most recently updated first.
    async fn list_sessions(&self, assistant_id: &str) -> Result<Vec<SessionSummary>>;

    /// Write both messages in one transaction and bump the session's
    /// `updated_at`.
    async fn append_exchange(&self, user: &Message, reply: &Message) -> Result<()>;

    /// Messages of one session, oldest first.
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode_err(message: String) -> Error {
    Error::Storage(sqlx::Error::Decode(message.into()))
}

fn parse_column<T: FromStr<Err = Error>>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|e: Error| decode_err(format!("column {}: {}", column, e)))
}

fn assistant_from_row(row: &SqliteRow) -> Result<Assistant> {
    Ok(Assistant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        system_prompt: row.try_get("system_prompt")?,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        assistant_id: row.try_get("assistant_id")?,
        file_name: row.try_get("file_name")?,
        source_kind: parse_column(row, "source_kind")?,
        source_url: row.try_get("source_url")?,
        mime_type: row.try_get("mime_type")?,
        file_size: row.try_get("file_size")?,
        original_text: row.try_get("original_text")?,
        chunks: row.try_get("chunks")?,
        status: parse_column(row, "status")?,
        uploaded_at: row.try_get("uploaded_at")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<ChatSession> {
    Ok(ChatSession {
        session_id: row.try_get("session_id")?,
        assistant_id: row.try_get("assistant_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let passages_json: Option<String> = row.try_get("retrieved_passages_json")?;
    let retrieved_passages = passages_json
        .map(|json| serde_json::from_str::<Vec<RetrievedPassage>>(&json))
        .transpose()
        .map_err(|e| decode_err(format!("retrieved_passages_json: {}", e)))?;
    Ok(Message {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        role: parse_column(row, "role")?,
        content: row.try_get("content")?,
        retrieved_passages,
        created_at: row.try_get("created_at")?,
    })
}

fn session_title(first_message: Option<&str>) -> String {
    match first_message {
        None => UNTITLED_SESSION.to_string(),
        Some(content) if content.chars().count() > TITLE_CHARS => {
            let head: String = content.chars().take(TITLE_CHARS).collect();
            format!("{}...", head)
        }
        Some(content) => content.to_string(),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_assistant(&self, id: &str) -> Result<Option<Assistant>> {
        let row = sqlx::query("SELECT * FROM assistants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(assistant_from_row).transpose()
    }

    async fn upsert_assistant(&self, assistant: &Assistant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO assistants (id, name, description, system_prompt, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                system_prompt = excluded.system_prompt
            "#,
        )
        .bind(&assistant.id)
        .bind(&assistant.name)
        .bind(&assistant.description)
        .bind(&assistant.system_prompt)
        .bind(assistant.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_assistants(&self) -> Result<Vec<Assistant>> {
        let rows = sqlx::query("SELECT * FROM assistants ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(assistant_from_row).collect()
    }

    async fn assistant_overviews(&self) -> Result<Vec<AssistantOverview>> {
        let mut overviews = Vec::new();
        for assistant in self.list_assistants().await? {
            let documents = sqlx::query(
                r#"
                SELECT id, file_name, chunks, uploaded_at FROM documents
                WHERE assistant_id = ? AND status = 'completed'
                ORDER BY uploaded_at DESC
                "#,
            )
            .bind(&assistant.id)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| -> Result<DocumentSummary> {
                Ok(DocumentSummary {
                    id: row.try_get("id")?,
                    file_name: row.try_get("file_name")?,
                    chunks: row.try_get("chunks")?,
                    uploaded_at: row.try_get("uploaded_at")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

            let document_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE assistant_id = ?")
                    .bind(&assistant.id)
                    .fetch_one(&self.pool)
                    .await?;
            let session_count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM chat_sessions WHERE assistant_id = ?")
                    .bind(&assistant.id)
                    .fetch_one(&self.pool)
                    .await?;

            overviews.push(AssistantOverview {
                assistant,
                documents,
                document_count,
                session_count,
            });
        }
        Ok(overviews)
    }

    async fn create_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, assistant_id, file_name, source_kind, source_url,
                                   mime_type, file_size, original_text, chunks, status,
                                   uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.assistant_id)
        .bind(&doc.file_name)
        .bind(doc.source_kind.as_str())
        .bind(&doc.source_url)
        .bind(&doc.mime_type)
        .bind(doc.file_size)
        .bind(&doc.original_text)
        .bind(doc.chunks)
        .bind(doc.status.as_str())
        .bind(doc.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        chunks: i64,
    ) -> Result<()> {
        // Only a processing document may move; terminal states are final.
        let result = sqlx::query(
            "UPDATE documents SET status = ?, chunks = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(chunks)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("processing document {}", id)));
        }
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn list_documents(&self, assistant_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE assistant_id = ? ORDER BY uploaded_at DESC, rowid DESC",
        )
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO chat_sessions (session_id, assistant_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.session_id)
        .bind(&session.assistant_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let row = sqlx::query("SELECT * FROM chat_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(&self, assistant_id: &str) -> Result<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT s.session_id, s.created_at, s.updated_at,
                   (SELECT m.content FROM messages m
                    WHERE m.session_id = s.session_id
                    ORDER BY m.created_at, m.rowid LIMIT 1) AS first_message,
                   (SELECT COUNT(*) FROM messages m
                    WHERE m.session_id = s.session_id) AS message_count
            FROM chat_sessions s
            WHERE s.assistant_id = ?
            ORDER BY s.updated_at DESC
            "#,
        )
        .bind(assistant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SessionSummary> {
                let first: Option<String> = row.try_get("first_message")?;
                Ok(SessionSummary {
                    id: row.try_get("session_id")?,
                    title: session_title(first.as_deref()),
                    message_count: row.try_get("message_count")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn append_exchange(&self, user: &Message, reply: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for message in [user, reply] {
            let passages_json = message
                .retrieved_passages
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| decode_err(format!("retrieved passages: {}", e)))?;
            sqlx::query(
                r#"
                INSERT INTO messages (id, session_id, role, content, retrieved_passages_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&message.id)
            .bind(&message.session_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(passages_json)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE session_id = ?")
            .bind(reply.created_at)
            .bind(&reply.session_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY created_at, rowid",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }
}
