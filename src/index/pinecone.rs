use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{check_lengths, into_scored, record_metadata, Namespace, VectorIndex};
use crate::config::IndexConfig;
use crate::error::{check_status, Error, Result};
use crate::models::{Passage, ScoredPassage};

const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
const API_VERSION: &str = "2025-04";
/// Pinecone caps upsert requests; 100 records keeps well under the limit.
const UPSERT_BATCH: usize = 100;

/// Vector index backed by a Pinecone serverless index.
///
/// One Pinecone namespace per assistant. The passage text travels in the
/// record metadata under `"text"`. Requires `PINECONE_API_KEY`.
pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
}

#[derive(Deserialize)]
struct DescribeIndexResponse {
    host: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl PineconeIndex {
    pub fn new(api_key: impl Into<String>, host: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            host: normalize_host(host),
            api_key: api_key.into(),
        })
    }

    /// Build a client from config, asking the control plane for the data-plane
    /// host when `[index].host` is not set.
    pub async fn connect(config: &IndexConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;
        let timeout = Duration::from_secs(config.timeout_secs);

        let host = match &config.host {
            Some(host) => host.clone(),
            None => {
                let name = config.resolved_name().ok_or_else(|| {
                    anyhow::anyhow!("index.name or PINECONE_INDEX_NAME is required")
                })?;
                describe_index(&api_key, &name, timeout).await?
            }
        };

        tracing::info!(host = %host, "connected to Pinecone index");
        Ok(Self::new(api_key, &host, timeout)?)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.host, path))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }
}

async fn describe_index(api_key: &str, name: &str, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client
        .get(format!("{}/indexes/{}", CONTROL_PLANE_URL, name))
        .header("Api-Key", api_key)
        .header("X-Pinecone-API-Version", API_VERSION)
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::not_found(format!("Pinecone index {}", name)));
    }
    let response = check_status(response, "Pinecone describe_index").await?;
    let parsed: DescribeIndexResponse = response.json().await?;
    Ok(parsed.host)
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn upsert(
        &self,
        namespace: &Namespace,
        passages: &[Passage],
        vectors: &[Vec<f32>],
    ) -> Result<()> {
        check_lengths(passages, vectors)?;

        for (batch_no, (passages, vectors)) in passages
            .chunks(UPSERT_BATCH)
            .zip(vectors.chunks(UPSERT_BATCH))
            .enumerate()
        {
            let mut records = Vec::with_capacity(passages.len());
            for (passage, values) in passages.iter().zip(vectors) {
                records.push(serde_json::json!({
                    "id": passage.id,
                    "values": values,
                    "metadata": record_metadata(passage)?,
                }));
            }

            let body = serde_json::json!({
                "vectors": records,
                "namespace": namespace.as_str(),
            });
            let response = self.post("/vectors/upsert").json(&body).send().await?;
            check_status(response, "Pinecone upsert").await?;
            tracing::debug!(
                namespace = namespace.as_str(),
                batch = batch_no,
                records = passages.len(),
                "upserted batch"
            );
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>> {
        let body = serde_json::json!({
            "namespace": namespace.as_str(),
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
            "includeValues": false,
        });
        let response = self.post("/query").json(&body).send().await?;
        // A namespace that was never written to is not an error.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response, "Pinecone query").await?;
        let parsed: QueryResponse = response.json().await?;
        Ok(into_passages(parsed))
    }
}

fn into_passages(response: QueryResponse) -> Vec<ScoredPassage> {
    response
        .matches
        .into_iter()
        .filter_map(|m| m.metadata.map(|meta| into_scored(meta, m.score)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(
            normalize_host("docs-abc.svc.pinecone.io"),
            "https://docs-abc.svc.pinecone.io"
        );
        assert_eq!(
            normalize_host("http://localhost:5080/"),
            "http://localhost:5080"
        );
    }

    #[test]
    fn test_query_response_parsing() {
        let json = r#"{
            "matches": [
                {"id": "p1", "score": 0.92, "metadata": {"text": "The sky is blue.", "fileName": "sky.txt"}},
                {"id": "p2", "score": 0.40}
            ],
            "namespace": "general-assistant-001",
            "usage": {"readUnits": 5}
        }"#;
        let parsed: QueryResponse = serde_json::from_str(json).unwrap();
        let passages = into_passages(parsed);
        assert_eq!(passages.len(), 1);
        assert_eq!(passages[0].text, "The sky is blue.");
        assert_eq!(passages[0].metadata["fileName"], "sky.txt");
        assert!((passages[0].score - 0.92).abs() < 1e-6);
    }

    #[test]
    fn test_empty_matches() {
        let parsed: QueryResponse = serde_json::from_str(r#"{"namespace": "x"}"#).unwrap();
        assert!(into_passages(parsed).is_empty());
    }
}
