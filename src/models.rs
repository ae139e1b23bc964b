//! Core data models used throughout docent.
//!
//! Assistants, documents, sessions and messages live in the relational
//! store. Passages only ever exist as vector-index records; the types here
//! describe the payload that travels with each vector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A knowledge domain with its own namespace and system prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Assistant {
    pub id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub created_at: i64,
}

/// Where a document's text came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Website,
    Text,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Pdf => "pdf",
            SourceKind::Website => "website",
            SourceKind::Text => "text",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(SourceKind::Pdf),
            "website" => Ok(SourceKind::Website),
            "text" => Ok(SourceKind::Text),
            other => Err(Error::invalid(format!("unknown source kind: {}", other))),
        }
    }
}

/// Document lifecycle. `Processing` moves to exactly one of the other two.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(Error::invalid(format!("unknown document status: {}", other))),
        }
    }
}

/// One ingested source, as stored relationally.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub assistant_id: String,
    pub file_name: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
    #[serde(skip_serializing)]
    pub original_text: String,
    pub chunks: i64,
    pub status: DocumentStatus,
    pub uploaded_at: i64,
}

/// Metadata stored alongside every passage vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PassageMetadata {
    pub assistant_id: String,
    pub document_id: String,
    pub file_name: String,
    pub source_kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// RFC 3339 ingestion time.
    pub ingested_at: String,
    /// SHA-256 of the passage text; lets duplicate passages be spotted.
    pub content_hash: String,
}

/// A chunk of document text ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Passage {
    pub id: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: PassageMetadata,
}

/// A search hit from the vector index.
///
/// Metadata is kept as raw JSON because records written by other tools into
/// the same index need not follow [`PassageMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPassage {
    pub text: String,
    pub metadata: serde_json::Value,
    pub score: f32,
}

/// A passage as shown to clients and attached to assistant messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    pub content: String,
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub score: f32,
}

impl From<ScoredPassage> for RetrievedPassage {
    fn from(p: ScoredPassage) -> Self {
        Self {
            content: p.text,
            metadata: p.metadata,
            score: p.score,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub session_id: String,
    pub assistant_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(Error::invalid(format!("unknown role: {}", other))),
        }
    }
}

/// One turn of a conversation.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_passages: Option<Vec<RetrievedPassage>>,
    pub created_at: i64,
}

/// Sidebar-style listing entry for a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub message_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A completed document as listed under its assistant.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: String,
    pub file_name: String,
    pub chunks: i64,
    pub uploaded_at: i64,
}

/// An assistant with its completed documents and record counts.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantOverview {
    #[serde(flatten)]
    pub assistant: Assistant,
    pub documents: Vec<DocumentSummary>,
    pub document_count: i64,
    pub session_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_roundtrip_names() {
        for kind in [SourceKind::Pdf, SourceKind::Website, SourceKind::Text] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("docx".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_passage_metadata_json_shape() {
        let meta = PassageMetadata {
            assistant_id: "a1".into(),
            document_id: "d1".into(),
            file_name: "notes.txt".into(),
            source_kind: SourceKind::Text,
            source_url: None,
            ingested_at: "2024-01-01T00:00:00Z".into(),
            content_hash: "abc".into(),
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["assistantId"], "a1");
        assert_eq!(json["sourceKind"], "text");
        assert!(json.get("sourceUrl").is_none());
    }

    #[test]
    fn test_document_hides_original_text() {
        let doc = Document {
            id: "d".into(),
            assistant_id: "a".into(),
            file_name: "f".into(),
            source_kind: SourceKind::Pdf,
            source_url: None,
            mime_type: Some("application/pdf".into()),
            file_size: Some(10),
            original_text: "secret body".into(),
            chunks: 0,
            status: DocumentStatus::Processing,
            uploaded_at: 0,
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("originalText").is_none());
        assert_eq!(json["status"], "processing");
    }
}
