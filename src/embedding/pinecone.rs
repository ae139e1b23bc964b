use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{EmbedMode, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{check_status, Error, Result};

const DEFAULT_URL: &str = "https://api.pinecone.io";
const DEFAULT_MODEL: &str = "llama-text-embed-v2";
const API_VERSION: &str = "2025-04";

/// Embedding provider using Pinecone Inference.
///
/// Calls `POST {url}/embed` with `input_type` set from the [`EmbedMode`] and
/// `truncate = "END"`, so over-long passages are cut rather than rejected.
/// Requires `PINECONE_API_KEY`.
pub struct PineconeEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    values: Option<Vec<f32>>,
    #[serde(default)]
    vector_type: Option<String>,
}

impl PineconeEmbeddings {
    pub fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        url: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url
                .unwrap_or_else(|| DEFAULT_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_key: api_key.into(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if `PINECONE_API_KEY` is not set.
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("PINECONE_API_KEY")
            .map_err(|_| anyhow::anyhow!("PINECONE_API_KEY environment variable not set"))?;
        Ok(Self::new(
            api_key,
            config.model.clone(),
            config.url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)
    }
}

#[async_trait]
impl EmbeddingProvider for PineconeEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<serde_json::Value> = texts
            .iter()
            .map(|t| serde_json::json!({ "text": t }))
            .collect();
        let body = serde_json::json!({
            "model": self.model,
            "parameters": {
                "input_type": mode.as_str(),
                "truncate": "END",
            },
            "inputs": inputs,
        });

        let response = self
            .client
            .post(format!("{}/embed", self.url))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "Pinecone embed").await?;
        let parsed: EmbedResponse = response.json().await?;
        parse_dense(parsed)
    }
}

fn parse_dense(response: EmbedResponse) -> Result<Vec<Vec<f32>>> {
    response
        .data
        .into_iter()
        .map(|item| match (item.vector_type.as_deref(), item.values) {
            (None | Some("dense"), Some(values)) => Ok(values),
            (kind, _) => Err(Error::upstream(format!(
                "expected dense embedding, got {}",
                kind.unwrap_or("no values")
            ))),
        })
        .collect()
}
