//! In-memory [`VectorIndex`] for development and tests.
//!
//! Uses a `HashMap` of namespaces behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every record in the namespace.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{check_lengths, into_scored, record_metadata, Namespace, VectorIndex};
use crate::error::Result;
use crate::models::{Passage, ScoredPassage};

struct StoredVector {
    _id: String,
    vector: Vec<f32>,
    metadata: serde_json::Value,
}

pub struct MemoryIndex {
    namespaces: RwLock<HashMap<String, Vec<StoredVector>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records stored under `namespace`.
    pub fn len(&self, namespace: &Namespace) -> usize {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        namespaces.get(namespace.as_str()).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, namespace: &Namespace) -> bool {
        self.len(namespace) == 0
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Cosine similarity; `0.0` for empty, mismatched or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(
        &self,
        namespace: &Namespace,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        check_lengths(passages, vectors)?;

        let mut records = Vec::with_capacity(passages.len());
        for (passage, vector) in passages.iter().zip(vectors) {
            records.push(StoredVector {
                _id: passage.id.clone(),
                vector: vector.clone(),
                metadata: record_metadata(passage)?,
            });
        }

        let mut namespaces = self.namespaces.write().unwrap_or_else(|e| e.into_inner());
        namespaces
            .entry(namespace.as_str().to_string())
            .or_default()
            .extend(records);
        Ok(())
    }

    async fn search(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let namespaces = self.namespaces.read().unwrap_or_else(|e| e.into_inner());
        let Some(records) = namespaces.get(namespace.as_str()) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(f32, &StoredVector)> = records
            .iter()
            .map(|r| (cosine_similarity(vector, &r.vector), r))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(score, r)| into_scored(r.metadata.clone(), score))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Assistant, PassageMetadata, SourceKind};

    fn assistant(id: &str) -> Assistant {
        Assistant {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            system_prompt: String::new(),
            created_at: 0,
        }
    }

    fn passage(assistant_id: &str, text: &str) -> Passage {
        Passage {
            id: uuid::Uuid::new_v4().to_string(),
            chunk_index: 0,
            text: text.to_string(),
            metadata: PassageMetadata {
                assistant_id: assistant_id.to_string(),
                document_id: "doc".to_string(),
                file_name: "f.txt".to_string(),
                source_kind: SourceKind::Text,
                source_url: None,
                ingested_at: "2024-01-01T00:00:00.000Z".to_string(),
                content_hash: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn test_search_orders_by_descending_similarity() {
        let index = MemoryIndex::new();
        let ns = Namespace::for_assistant(&assistant("a"));
        index
            .upsert(
                &ns,
                &[passage("a", "east"), passage("a", "north"), passage("a", "north-east")],
                &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
            )
            .await
            .unwrap();

        let hits = index.search(&ns, &[0.0, 1.0], 5).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["north", "north-east", "east"]);
        assert!(hits[0].score >= hits[1].score && hits[1].score >= hits[2].score);
    }

    #[tokio::test]
    async fn test_top_k_truncates() {
        let index = MemoryIndex::new();
        let ns = Namespace::for_assistant(&assistant("a"));
        let passages: Vec<Passage> = (0..10).map(|i| passage("a", &i.to_string())).collect();
        let vectors: Vec<Vec<f32>> = (0..10).map(|i| vec![1.0, i as f32]).collect();
        index.upsert(&ns, &passages, &vectors).await.unwrap();
        assert_eq!(index.search(&ns, &[1.0, 1.0], 5).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let index = MemoryIndex::new();
        let ns_a = Namespace::for_assistant(&assistant("assistantA"));
        let ns_b = Namespace::for_assistant(&assistant("assistantB"));
        index
            .upsert(&ns_a, &[passage("assistantA", "secret")], &[vec![1.0, 0.0]])
            .await
            .unwrap();

        assert!(index.search(&ns_b, &[1.0, 0.0], 5).await.unwrap().is_empty());
        assert_eq!(index.search(&ns_a, &[1.0, 0.0], 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_namespace_is_empty_not_error() {
        let index = MemoryIndex::new();
        let ns = Namespace::for_assistant(&assistant("nobody"));
        assert!(index.search(&ns, &[1.0], 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reupsert_adds_records() {
        let index = MemoryIndex::new();
        let ns = Namespace::for_assistant(&assistant("a"));
        for _ in 0..2 {
            index
                .upsert(&ns, &[passage("a", "same text")], &[vec![1.0]])
                .await
                .unwrap();
        }
        assert_eq!(index.len(&ns), 2);
    }

    #[tokio::test]
    async fn test_length_mismatch_rejected() {
        let index = MemoryIndex::new();
        let ns = Namespace::for_assistant(&assistant("a"));
        let err = index
            .upsert(&ns, &[passage("a", "x")], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::InvalidInput(_)));
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        assert!((cosine_similarity(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}
