use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{EmbedMode, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{check_status, Result};

const DEFAULT_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "text-embedding-3-small";

/// Embedding provider using the OpenAI embeddings API.
///
/// Calls `POST {url}/embeddings`. OpenAI models are symmetric, so the
/// [`EmbedMode`] is not sent. Requires `OPENAI_API_KEY`.
pub struct OpenAIEmbeddings {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAIEmbeddings {
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
    /// Returns an error if `OPENAI_API_KEY` is not set.
    pub fn from_config(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(
            api_key,
            config.model.clone(),
            config.url.clone(),
            Duration::from_secs(config.timeout_secs),
        )?)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddings {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let response = check_status(response, "OpenAI embeddings").await?;
        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(into_ordered(parsed))
    }
}

/// The API tags each vector with its input index; sort on it.
fn into_ordered(response: EmbeddingsResponse) -> Vec<Vec<f32>> {
    let mut data = response.data;
    data.sort_by_key(|item| item.index);
    data.into_iter().map(|item| item.embedding).collect()
}
