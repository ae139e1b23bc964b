//! Retrieval-augmented question answering.
//!
//! Both entry points share the same front half:
//!
//! 1. load the assistant ([`Error::NotFound`] if absent) and check the
//!    session belongs to it;
//! 2. embed the question in query mode and take the top-K passages from the
//!    assistant's namespace;
//! 3. with no passages, answer [`NO_CONTENT_RESPONSE`] without calling the
//!    generator or persisting anything.
//!
//! [`QueryEngine::answer`] then makes one generation call.
//! [`QueryEngine::answer_stream`] spawns a producer task that forwards token
//! fragments over a bounded channel and finishes with exactly one terminal
//! event. The message pair is written only after the token stream ends
//! naturally; a cancelled or failed turn leaves no messages behind.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::embedding::BatchEmbedder;
use crate::error::{Error, Result};
use crate::generation::Generator;
use crate::index::{Namespace, VectorIndex};
use crate::models::{Assistant, ChatSession, Message, RetrievedPassage, Role, SessionSummary};
use crate::store::Store;
use crate::transport::StreamEvent;

pub const NO_CONTENT_RESPONSE: &str = "I don't have specific information about that in my knowledge base. Please upload relevant documents first.";

const GROUNDING_INSTRUCTION: &str = "Answer based on the provided context. If the context doesn't contain relevant information, say so clearly.";

const EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub response: String,
    pub retrieved_passages: Vec<RetrievedPassage>,
}

/// Compose the single prompt sent to the generator.
pub fn build_prompt(system_prompt: &str, passages: &[RetrievedPassage], question: &str) -> String {
    let context = passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[Source {}] {}", i + 1, p.content))
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "{}\n\nContext from knowledge base:\n{}\n\nQuestion: {}\n\n{}",
        system_prompt, context, question, GROUNDING_INSTRUCTION
    )
}

pub struct QueryEngine {
    store: Arc<dyn Store>,
    embedder: Arc<BatchEmbedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    top_k: usize,
}

/// How a streaming turn stopped early.
enum Stop {
    /// The consumer went away.
    Closed,
    Failed(Error),
}

impl From<Error> for Stop {
    fn from(e: Error) -> Self {
        Stop::Failed(e)
    }
}

/// Outcome of the shared retrieval steps.
enum Prepared {
    Fallback,
    Grounded {
        prompt: String,
        passages: Vec<RetrievedPassage>,
    },
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<BatchEmbedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            generator,
            top_k: 5,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Answer `question` in one generation call.
    pub async fn answer(
        &self,
        question: &str,
        assistant_id: &str,
        session_id: Option<&str>,
    ) -> Result<Answer> {
        let assistant = self.load_assistant(assistant_id).await?;
        self.check_session(&assistant, session_id).await?;

        let (prompt, passages) = match self.prepare(&assistant, question).await? {
            Prepared::Fallback => {
                return Ok(Answer {
                    response: NO_CONTENT_RESPONSE.to_string(),
                    retrieved_passages: Vec::new(),
                })
            }
            Prepared::Grounded { prompt, passages } => (prompt, passages),
        };

        let response = self.generator.complete(&prompt).await?;
        if let Some(session_id) = session_id {
            self.persist(&assistant, session_id, question, &response, &passages)
                .await?;
        }

        Ok(Answer {
            response,
            retrieved_passages: passages,
        })
    }

    /// Answer `question` as a stream of events.
    ///
    /// Every failure, including an unknown assistant, arrives as a terminal
    /// [`StreamEvent::Error`]. Dropping or cancelling the returned stream stops
    /// the producer.
    pub fn answer_stream(
        self: &Arc<Self>,
        question: String,
        assistant_id: String,
        session_id: Option<String>,
    ) -> AnswerStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let engine = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            let turn = engine.stream_turn(&question, &assistant_id, session_id.as_deref(), &tx);
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(assistant = %assistant_id, "answer stream cancelled");
                }
                _ = tx.closed() => {
                    debug!(assistant = %assistant_id, "answer stream consumer dropped");
                }
                result = turn => match result {
                    Ok(()) | Err(Stop::Closed) => {}
                    Err(Stop::Failed(e)) => {
                        warn!(assistant = %assistant_id, error = %e, "answer stream failed");
                        let _ = tx.send(StreamEvent::error(e.to_string())).await;
                    }
                },
            }
        });

        AnswerStream { rx, cancel }
    }

    async fn stream_turn(
        &self,
        question: &str,
        assistant_id: &str,
        session_id: Option<&str>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<(), Stop> {
        let assistant = self.load_assistant(assistant_id).await?;
        self.check_session(&assistant, session_id).await?;

        let (prompt, passages) = match self.prepare(&assistant, question).await? {
            Prepared::Fallback => {
                emit(
                    tx,
                    StreamEvent::Fragment {
                        content: NO_CONTENT_RESPONSE.to_string(),
                        retrieved_passages: Vec::new(),
                    },
                )
                .await?;
                return emit(tx, StreamEvent::Done).await;
            }
            Prepared::Grounded { prompt, passages } => (prompt, passages),
        };

        let mut tokens = self.generator.stream(&prompt).await?;
        let mut full = String::new();
        while let Some(token) = tokens.next().await {
            let token = token?;
            if token.is_empty() {
                continue;
            }
            full.push_str(&token);
            emit(
                tx,
                StreamEvent::Fragment {
                    content: token,
                    retrieved_passages: passages.clone(),
                },
            )
            .await?;
        }

        if let Some(session_id) = session_id {
            if full.is_empty() {
                debug!(session = session_id, "empty answer not persisted");
            } else {
                self.persist(&assistant, session_id, question, &full, &passages)
                    .await?;
            }
        }
        emit(tx, StreamEvent::Done).await
    }

    async fn load_assistant(&self, id: &str) -> Result<Assistant> {
        self.store
            .get_assistant(id)
            .await?
            .ok_or_else(|| Error::not_found(format!("assistant {}", id)))
    }

    /// A session id may be new, but not one owned by another assistant.
    async fn check_session(&self, assistant: &Assistant, session_id: Option<&str>) -> Result<()> {
        let Some(session_id) = session_id else {
            return Ok(());
        };
        if session_id.trim().is_empty() {
            return Err(Error::invalid("session id must not be empty"));
        }
        match self.store.get_session(session_id).await? {
            Some(session) if session.assistant_id != assistant.id => Err(Error::invalid(format!(
                "session {} belongs to another assistant",
                session_id
            ))),
            _ => Ok(()),
        }
    }

    async fn prepare(&self, assistant: &Assistant, question: &str) -> Result<Prepared> {
        let vector = self.embedder.embed_query(question).await?;
        let namespace = Namespace::for_assistant(assistant);
        let hits = self.index.search(&namespace, &vector, self.top_k).await?;

        info!(assistant = %assistant.id, passages = hits.len(), "retrieved passages");
        if hits.is_empty() {
            return Ok(Prepared::Fallback);
        }

        let passages: Vec<RetrievedPassage> = hits.into_iter().map(Into::into).collect();
        let prompt = build_prompt(&assistant.system_prompt, &passages, question);
        Ok(Prepared::Grounded { prompt, passages })
    }

    async fn persist(
        &self,
        assistant: &Assistant,
        session_id: &str,
        question: &str,
        answer: &str,
        passages: &[RetrievedPassage],
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if self.store.get_session(session_id).await?.is_none() {
            self.store
                .create_session(&ChatSession {
                    session_id: session_id.to_string(),
                    assistant_id: assistant.id.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .await?;
        }

        let user = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::User,
            content: question.to_string(),
            retrieved_passages: None,
            created_at: now,
        };
        let reply = Message {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role: Role::Assistant,
            content: answer.to_string(),
            retrieved_passages: Some(passages.to_vec()),
            created_at: now,
        };
        self.store.append_exchange(&user, &reply).await?;
        debug!(session = session_id, "persisted exchange");
        Ok(())
    }

    /// Open a new session for `assistant_id`; returns its `session_<uuid>` id.
    pub async fn create_session(&self, assistant_id: &str) -> Result<String> {
        let assistant = self.load_assistant(assistant_id).await?;
        let now = chrono::Utc::now().timestamp_millis();
        let session_id = format!("session_{}", Uuid::new_v4().simple());
        self.store
            .create_session(&ChatSession {
                session_id: session_id.clone(),
                assistant_id: assistant.id,
                created_at: now,
                updated_at: now,
            })
            .await?;
        Ok(session_id)
    }

    pub async fn list_sessions(&self, assistant_id: &str) -> Result<Vec<SessionSummary>> {
        let assistant = self.load_assistant(assistant_id).await?;
        self.store.list_sessions(&assistant.id).await
    }

    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        if self.store.get_session(session_id).await?.is_none() {
            return Err(Error::not_found(format!("session {}", session_id)));
        }
        self.store.list_messages(session_id).await
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> std::result::Result<(), Stop> {
    tx.send(event).await.map_err(|_| Stop::Closed)
}

/// Consumer side of a streamed answer.
///
/// Yields fragments in generation order and ends after one terminal event.
/// Dropping it cancels the producer.
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

impl AnswerStream {
    /// Stop the producer. Events already buffered may still be read;
    /// nothing from this turn is persisted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for AnswerStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
