//! Vector index gateway.
//!
//! The [`VectorIndex`] trait is the only way passages enter or leave the
//! vector store. Every call is scoped to a [`Namespace`], and a namespace can
//! only be built from a loaded [`Assistant`], so one assistant's passages can
//! never be searched on behalf of another.
//!
//! Backends:
//! - **[`PineconeIndex`]**: Pinecone data plane over HTTPS.
//! - **[`MemoryIndex`]**: brute-force cosine similarity in process, for
//!   local development and tests.
//!
//! Re-ingesting a document adds a second set of passages; nothing here
//! deduplicates. Each record carries a `contentHash` so duplicates can be
//! found after the fact.

mod memory;
mod pinecone;

pub use memory::MemoryIndex;
pub use pinecone::PineconeIndex;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::models::{Assistant, Passage, ScoredPassage};

/// Metadata key holding the passage text inside an index record.
pub const TEXT_KEY: &str = "text";

/// A per-assistant partition of the vector index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace(String);

impl Namespace {
    pub fn for_assistant(assistant: &Assistant) -> Self {
        Self(assistant.id.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Store `passages[i]` with `vectors[i]` under `namespace`.
    async fn upsert(
        &self,
        namespace: &Namespace,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> Result<()>;

    /// Up to `top_k` passages, most similar first. Unknown or empty
    /// namespaces give an empty list.
    async fn search(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>>;
}

/// Build the record metadata stored with a passage: its
/// [`PassageMetadata`](crate::models::PassageMetadata) fields plus the text
/// and position.
pub(crate) fn record_metadata(passage: &Passage) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(&passage.metadata)?;
    if let Some(map) = value.as_object_mut() {
        map.insert(TEXT_KEY.to_string(), passage.text.clone().into());
        map.insert("chunkIndex".to_string(), passage.chunk_index.into());
    }
    Ok(value)
}

/// Split a stored record's metadata back into text and the remaining fields.
pub(crate) fn into_scored(mut metadata: serde_json::Value, score: f32) -> ScoredPassage {
    let text = metadata
        .as_object_mut()
        .and_then(|m| m.remove(TEXT_KEY))
        .and_then(|t| t.as_str().map(str::to_string))
        .unwrap_or_default();
    ScoredPassage {
        text,
        metadata,
        score,
    }
}

pub(crate) fn check_lengths(passages: &[Passage], vectors: &[Vec<f32>]) -> Result<()> {
    if passages.len() != vectors.len() {
        return Err(Error::invalid(format!(
            "{} passages but {} vectors",
            passages.len(),
            vectors.len()
        )));
    }
    Ok(())
}

/// Create the configured [`VectorIndex`].
///
/// | Config Value | Index |
/// |-------------|-------|
/// | `"pinecone"` | [`PineconeIndex`] |
/// | `"memory"` | [`MemoryIndex`] |
pub async fn create_index(config: &IndexConfig) -> anyhow::Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "pinecone" => Ok(Arc::new(PineconeIndex::connect(config).await?)),
        "memory" => Ok(Arc::new(MemoryIndex::new())),
        other => anyhow::bail!("Unknown index provider: {}", other),
    }
}
