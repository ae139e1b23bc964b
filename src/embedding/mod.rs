//! Embedding provider abstraction and the batch embedding client.
//!
//! Defines the [`EmbeddingProvider`] trait and two HTTP backends:
//! - **[`PineconeEmbeddings`]**: Pinecone Inference (`llama-text-embed-v2`),
//!   reached with the same credentials as the vector index.
//! - **[`OpenAIEmbeddings`]**: any OpenAI-compatible `/embeddings` endpoint.
//!
//! Callers never talk to a provider directly. They go through
//! [`BatchEmbedder`], which owns batching, pacing and retry.
//!
//! # Batching and Retry
//!
//! - Inputs are cut into batches of `batch_size` (default 32) and sent one
//!   after another, never concurrently, with `batch_delay` (default 1s)
//!   between batches.
//! - A batch that is rate limited (HTTP 429) is retried up to `max_retries`
//!   (default 3) more times, waiting 1s, 2s, 4s.
//! - Any other error, or a 429 after the budget, aborts the whole call.
//!   Vectors from earlier batches are dropped with it.
//!
//! # Provider Selection
//!
//! ```rust,no_run
//! # use docent::config::EmbeddingConfig;
//! # use docent::embedding::{create_provider, BatchEmbedder};
//! let config = EmbeddingConfig::default(); // provider = "pinecone"
//! let provider = create_provider(&config).unwrap();
//! let embedder = BatchEmbedder::from_config(provider, &config);
//! ```

mod openai;
mod pinecone;

pub use openai::OpenAIEmbeddings;
pub use pinecone::PineconeEmbeddings;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Whether texts are stored passages or a search query.
///
/// Asymmetric models embed the two differently; symmetric ones ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedMode {
    Passage,
    Query,
}

impl EmbedMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbedMode::Passage => "passage",
            EmbedMode::Query => "query",
        }
    }
}

/// One upstream embedding backend.
///
/// Implementations make a single request per call and report HTTP 429 as
/// [`Error::UpstreamRateLimited`]; they do not retry on their own.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"llama-text-embed-v2"`).
    fn model_name(&self) -> &str;

    /// Embed one batch, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>>;
}

/// Exponential backoff on rate-limit errors only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt + 1`: `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }

    /// Run `operation`, retrying while it reports a rate limit.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(e) if e.is_rate_limited() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        of = self.max_retries + 1,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Order-preserving, rate-limit-aware embedding client.
#[derive(Clone)]
pub struct BatchEmbedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    batch_delay: Duration,
    retry: RetryPolicy,
}

impl BatchEmbedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            batch_size: 32,
            batch_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_config(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::new(provider)
            .with_batch_size(config.batch_size)
            .with_batch_delay(config.batch_delay())
            .with_retry(RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.backoff_base(),
            })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Embed `texts`, one vector per text, in input order.
    pub async fn embed(&self, texts: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        let mut vectors = Vec::with_capacity(texts.len());

        info!(
            texts = texts.len(),
            batches = batches.len(),
            model = self.provider.model_name(),
            "embedding"
        );

        for (i, batch) in batches.iter().enumerate() {
            let embedded = self.embed_one_batch(batch, mode).await?;
            vectors.extend(embedded);
            debug!(batch = i + 1, of = batches.len(), "embedded batch");

            if i + 1 < batches.len() && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        Ok(vectors)
    }

    /// Embed a search query: one single-item request, no pacing delay.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let input = [text.to_string()];
        self.embed_one_batch(&input, EmbedMode::Query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream("empty embedding response"))
    }

    async fn embed_one_batch(&self, batch: &[String], mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        let provider = self.provider.as_ref();
        let vectors = self
            .retry
            .run(|| provider.embed_batch(batch, mode))
            .await?;

        if vectors.len() != batch.len() {
            return Err(Error::upstream(format!(
                "embedding provider returned {} vectors for {} inputs",
                vectors.len(),
                batch.len()
            )));
        }
        Ok(vectors)
    }
}

/// Create the configured [`EmbeddingProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"pinecone"` | [`PineconeEmbeddings`] |
/// | `"openai"` | [`OpenAIEmbeddings`] |
///
/// # Errors
///
/// Unknown provider names, or a missing API key in the environment.
pub fn create_provider(config: &EmbeddingConfig) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "pinecone" => Ok(Arc::new(PineconeEmbeddings::from_config(config)?)),
        "openai" => Ok(Arc::new(OpenAIEmbeddings::from_config(config)?)),
        other => anyhow::bail!("Unknown embedding provider: {}", other),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic provider: vector = [len, first byte, index-in-call].
    ///
    /// Scripted failures are consumed one per call before any success.
    pub struct ScriptedProvider {
        pub calls: AtomicUsize,
        pub batch_sizes: Mutex<Vec<usize>>,
        failures: Mutex<VecDeque<Error>>,
    }

    impl ScriptedProvider {
        pub fn new() -> Self {
            Self::failing_with(Vec::new())
        }

        pub fn failing_with(failures: Vec<Error>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                failures: Mutex::new(failures.into()),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for ScriptedProvider {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn embed_batch(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.batch_sizes.lock().unwrap().push(texts.len());
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    vec![
                        t.len() as f32,
                        t.bytes().next().unwrap_or(0) as f32,
                        i as f32,
                    ]
                })
                .collect())
        }
    }

    pub fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    pub fn rate_limited() -> Error {
        Error::UpstreamRateLimited("429 Too Many Requests".to_string())
    }
}
