//! Text generation backends.
//!
//! [`Generator`] is the seam between the query engine and the language
//! model service: one complete answer, or a stream of token fragments.
//! [`OpenAIChatGenerator`] talks to any OpenAI-compatible
//! `/chat/completions` endpoint. Requires `OPENAI_API_KEY`.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use crate::config::GenerationConfig;
use crate::error::{check_status, Error, Result};
use crate::transport::{data_payload, LineBuffer};

/// Token fragments in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait Generator: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Start a streamed completion. Errors before the first byte are
    /// returned here; later ones arrive as stream items.
    async fn stream(&self, prompt: &str) -> Result<TokenStream>;
}

pub struct OpenAIChatGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAIChatGenerator {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        url: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not set.
    pub fn from_config(config: &GenerationConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self::new(
            api_key,
            config.model.clone(),
            &config.url,
            Duration::from_secs(config.timeout_secs),
        )?)
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": stream,
        });
        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        check_status(response, "OpenAI chat").await
    }
}

#[async_trait]
impl Generator for OpenAIChatGenerator {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self.send(prompt, false).await?;
        let parsed: CompletionResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::upstream("completion contained no message"))
    }

    async fn stream(&self, prompt: &str) -> Result<TokenStream> {
        let response = self.send(prompt, true).await?;
        Ok(Box::pin(decode_chat_stream(Box::pin(response.bytes_stream()))))
    }
}

struct ChunkState<S> {
    body: S,
    lines: LineBuffer,
    ready: VecDeque<String>,
    finished: bool,
}

/// Decode an OpenAI `stream: true` body into non-empty content deltas.
/// Ends at `data: [DONE]` or when the body ends.
fn decode_chat_stream<S, B, E>(body: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: Into<Error> + Send,
{
    let state = ChunkState {
        body,
        lines: LineBuffer::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(token) = state.ready.pop_front() {
                return Some((Ok(token), state));
            }
            if state.finished {
                return None;
            }

            let lines = match state.body.next().await {
                Some(Ok(chunk)) => state.lines.push(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.finished = true;
                    state.lines.finish().into_iter().collect()
                }
            };

            for line in lines {
                let Some(data) = data_payload(&line) else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    state.finished = true;
                    break;
                }
                match parse_delta(data) {
                    Ok(Some(token)) => state.ready.push_back(token),
                    Ok(None) => {}
                    Err(e) => {
                        state.finished = true;
                        state.ready.clear();
                        return Some((Err(e), state));
                    }
                }
            }
        }
    })
}

fn parse_delta(data: &str) -> Result<Option<String>> {
    let chunk: ChunkResponse = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|content| !content.is_empty()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies with fixed fragments; counts calls.
    pub struct ScriptedGenerator {
        pub fragments: Vec<String>,
        /// Emitted as a stream item after the fragments, when set.
        pub fail_mid_stream: Option<String>,
        /// Delay before each streamed fragment.
        pub pace: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        pub fn new(fragments: &[&str]) -> Self {
            Self {
                fragments: fragments.iter().map(|f| f.to_string()).collect(),
                fail_mid_stream: None,
                pace: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.fragments.concat())
        }

        async fn stream(&self, _prompt: &str) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut items: Vec<Result<String>> =
                self.fragments.iter().cloned().map(Ok).collect();
            if let Some(message) = &self.fail_mid_stream {
                items.push(Err(Error::upstream(message.clone())));
            }
            let pace = self.pace;
            Ok(Box::pin(futures::stream::iter(items).then(move |item| async move {
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                item
            })))
        }
    }
}
