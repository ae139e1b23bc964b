//! Ingestion pipeline orchestration.
//!
//! Turns text into indexed passages for one assistant:
//! assistant lookup → document row (`processing`) → chunking → embedding →
//! upsert into the assistant's namespace → `completed`.
//!
//! A failure after the document row exists marks it `failed` and returns the
//! original error. Nothing is retried here; the embedding client has its own
//! rate-limit retry.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::chunk::{chunk_fragments, ChunkProfile, ChunkTags};
use crate::config::ChunkingConfig;
use crate::embedding::{BatchEmbedder, EmbedMode};
use crate::error::{Error, Result};
use crate::index::{Namespace, VectorIndex};
use crate::loader::DocumentLoader;
use crate::models::{Assistant, Document, DocumentStatus, SourceKind};
use crate::store::Store;

/// Describes the source being ingested.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub assistant_id: String,
    pub file_name: String,
    pub source_kind: SourceKind,
    pub source_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<i64>,
}

impl IngestRequest {
    pub fn new(
        assistant_id: impl Into<String>,
        file_name: impl Into<String>,
        source_kind: SourceKind,
    ) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            file_name: file_name.into(),
            source_kind,
            source_url: None,
            mime_type: None,
            file_size: None,
        }
    }

    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_file_size(mut self, size: i64) -> Self {
        self.file_size = Some(size);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub document_id: String,
    pub chunks_created: usize,
    /// Characters of text stored as the document's original text.
    pub extracted_chars: usize,
}

pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    embedder: Arc<BatchEmbedder>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<BatchEmbedder>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            chunking,
        }
    }

    /// Ingest directly supplied text with the text chunking profile.
    pub async fn ingest_text(&self, text: &str, request: IngestRequest) -> Result<IngestOutcome> {
        let assistant = self.load_assistant(&request.assistant_id).await?;
        let fragments = [text];
        self.run(&assistant, &request, text.to_string(), &fragments, &self.chunking.text)
            .await
    }

    /// Ingest whatever `loader` produces, with the loader chunking profile.
    ///
    /// Each fragment is chunked on its own. The stored original text is the
    /// fragments joined by blank lines, and `file_size` defaults to its length
    /// in characters.
    pub async fn ingest_from_loader(
        &self,
        loader: &dyn DocumentLoader,
        mut request: IngestRequest,
    ) -> Result<IngestOutcome> {
        let assistant = self.load_assistant(&request.assistant_id).await?;

        let fragments = loader.load().await?;
        if fragments.is_empty() {
            return Err(Error::NoContent(format!(
                "nothing could be loaded from {}",
                request.file_name
            )));
        }

        let combined = fragments.join("\n\n");
        if request.file_size.is_none() {
            request.file_size = Some(combined.chars().count() as i64);
        }
        self.run(&assistant, &request, combined, &fragments, &self.chunking.loader)
            .await
    }

    async fn load_assistant(&self, id: &str) -> Result<Assistant> {
        self.store
            .get_assistant(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("assistant {}", id)))
    }

    async fn run<S: AsRef<str> + Sync>(
        &self,
        assistant: &Assistant,
        request: &IngestRequest,
        original_text: String,
        fragments: &[S],
        profile: &ChunkProfile,
    ) -> Result<IngestOutcome> {
        let extracted_chars = original_text.chars().count();
        let document = Document {
            id: Uuid::new_v4().to_string(),
            assistant_id: assistant.id.clone(),
            file_name: request.file_name.clone(),
            source_kind: request.source_kind,
            source_url: request.source_url.clone(),
            mime_type: request.mime_type.clone(),
            file_size: request.file_size,
            original_text,
            chunks: 0,
            status: DocumentStatus::Processing,
            uploaded_at: Utc::now().timestamp_millis(),
        };
        self.store.create_document(&document).await?;

        info!(
            document = %document.id,
            assistant = %assistant.id,
            file = %document.file_name,
            kind = %document.source_kind,
            "ingesting document"
        );

        match self.index_document(assistant, &document, fragments, profile).await {
            Ok(chunks) => {
                self.store
                    .set_document_status(&document.id, DocumentStatus::Completed, chunks as i64)
                    .await?;
                info!(document = %document.id, chunks, "document completed");
                Ok(IngestOutcome {
                    document_id: document.id,
                    chunks_created: chunks,
                    extracted_chars,
                })
            }
            Err(e) => {
                error!(document = %document.id, error = %e, "document ingestion failed");
                if let Err(mark_err) = self
                    .store
                    .set_document_status(&document.id, DocumentStatus::Failed, 0)
                    .await
                {
                    error!(document = %document.id, error = %mark_err, "could not mark document failed");
                }
                Err(e)
            }
        }
    }

    /// Chunk, embed and upsert; returns the number of passages written.
    async fn index_document<S: AsRef<str> + Sync>(
        &self,
        assistant: &Assistant,
        document: &Document,
        fragments: &[S],
        profile: &ChunkProfile,
    ) -> Result<usize> {
        let tags = ChunkTags {
            assistant_id: assistant.id.clone(),
            document_id: document.id.clone(),
            file_name: document.file_name.clone(),
            source_kind: document.source_kind,
            source_url: document.source_url.clone(),
            ingested_at: Utc::now(),
        };
        let passages = chunk_fragments(fragments, profile, &tags);
        if passages.is_empty() {
            return Err(Error::NoContent(format!(
                "{} produced no passages",
                document.file_name
            )));
        }
        info!(document = %document.id, passages = passages.len(), "chunked");

        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let vectors = self.embedder.embed(&texts, EmbedMode::Passage).await?;

        let namespace = Namespace::for_assistant(assistant);
        self.index.upsert(&namespace, &passages, &vectors).await?;
        Ok(passages.len())
    }
}
