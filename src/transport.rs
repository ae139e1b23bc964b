//! Event-stream framing for streamed answers.
//!
//! Server side, each [`StreamEvent`] becomes one `data: <JSON>\n\n` frame:
//!
//! | Event | JSON |
//! |-------|------|
//! | fragment | `{"content": "...", "retrievedPassages": [...]}` |
//! | done | `{"content": "", "done": true}` |
//! | error | `{"error": "...", "done": true}` |
//!
//! Client side, network reads may split a frame anywhere (even inside a
//! UTF-8 sequence). [`LineBuffer`] keeps the incomplete tail until the next
//! read and only hands out whole lines; [`EventStreamDecoder`] turns those
//! lines back into events.

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Response};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::convert::Infallible;

use crate::error::{Error, Result};
use crate::models::RetrievedPassage;

pub const EVENT_STREAM_MIME: &str = "text/event-stream";

const DATA_PREFIX: &str = "data:";

/// One event of a streamed answer. `Done` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment {
        content: String,
        retrieved_passages: Vec<RetrievedPassage>,
    },
    Done,
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Fragment { .. })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retrieved_passages: Option<Vec<RetrievedPassage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    done: bool,
}

impl From<&StreamEvent> for EventPayload {
    fn from(event: &StreamEvent) -> Self {
        match event {
            StreamEvent::Fragment {
                content,
                retrieved_passages,
            } => EventPayload {
                content: Some(content.clone()),
                retrieved_passages: Some(retrieved_passages.clone()),
                ..Default::default()
            },
            StreamEvent::Done => EventPayload {
                content: Some(String::new()),
                done: true,
                ..Default::default()
            },
            StreamEvent::Error { error } => EventPayload {
                error: Some(error.clone()),
                done: true,
                ..Default::default()
            },
        }
    }
}

impl From<EventPayload> for StreamEvent {
    fn from(payload: EventPayload) -> Self {
        match payload {
            EventPayload {
                error: Some(error), ..
            } => StreamEvent::Error { error },
            EventPayload { done: true, .. } => StreamEvent::Done,
            EventPayload {
                content,
                retrieved_passages,
                ..
            } => StreamEvent::Fragment {
                content: content.unwrap_or_default(),
                retrieved_passages: retrieved_passages.unwrap_or_default(),
            },
        }
    }
}

/// Frame one event as `data: <JSON>\n\n`.
pub fn encode_event(event: &StreamEvent) -> Bytes {
    // EventPayload holds only strings, bools and JSON values.
    let json = serde_json::to_string(&EventPayload::from(event))
        .unwrap_or_else(|_| r#"{"error":"unencodable event","done":true}"#.to_string());
    Bytes::from(format!("{} {}\n\n", DATA_PREFIX, json))
}

/// Parse the JSON of one `data:` line.
pub fn decode_event(json: &str) -> Result<StreamEvent> {
    let payload: EventPayload = serde_json::from_str(json)?;
    Ok(payload.into())
}

/// Pass events through up to and including the first terminal one. A
/// stream that ends without a terminal event gets an error appended.
pub fn until_terminal<S>(events: S) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    futures::stream::unfold(Some(Box::pin(events)), |state| async move {
        let mut events = state?;
        match events.next().await {
            Some(event) if event.is_terminal() => Some((event, None)),
            Some(event) => Some((event, Some(events))),
            None => Some((StreamEvent::error("answer stream ended unexpectedly"), None)),
        }
    })
}

/// An axum response streaming `events` as `text/event-stream`.
///
/// Dropping the response body (client disconnect) drops `events`, which is
/// how cancellation reaches the producer.
pub fn event_stream_body<S>(events: S) -> Response
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let frames = until_terminal(events).map(|event| Ok::<_, Infallible>(encode_event(&event)));
    let mut response = Body::from_stream(frames).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_MIME),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

/// Splits a byte stream into lines, carrying partial lines between reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read and return every line it completed, without the line
    /// terminator (`\n` or `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect()
    }

    /// The unterminated tail, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let rest = rest.strip_suffix(b"\r").unwrap_or(&rest);
        Some(String::from_utf8_lossy(rest).into_owned())
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// The payload of a `data:` line; `None` for blank lines, comments and other
/// fields.
pub fn data_payload(line: &str) -> Option<&str> {
    let rest = line.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Incremental decoder for the frames produced by [`encode_event`].
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    lines: LineBuffer,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one read; returns the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| data_payload(line))
            .map(decode_event)
            .collect()
    }

    /// Decode a final unterminated line, if the stream ended mid-frame.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>> {
        match self.lines.finish() {
            Some(line) => data_payload(&line).map(decode_event).into_iter().collect(),
            None => Ok(Vec::new()),
        }
    }
}

struct DecodeState<S> {
    body: S,
    decoder: EventStreamDecoder,
    ready: VecDeque<StreamEvent>,
    finished: bool,
}

/// Decode a stream of byte chunks into events, ending after the first
/// terminal event or the first error.
pub fn decode_event_stream<S, B, E>(body: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let state = DecodeState {
        body,
        decoder: EventStreamDecoder::new(),
        ready: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                if event.is_terminal() {
                    state.ready.clear();
                    state.finished = true;
                }
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            let decoded = match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.push(chunk.as_ref()),
                Some(Err(e)) => Err(e.into()),
                None => {
                    state.finished = true;
                    state.decoder.finish()
                }
            };
            match decoded {
                Ok(events) => state.ready.extend(events),
                Err(e) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
}

/// Decode the body of a streaming chat response.
pub fn read_event_stream(response: reqwest::Response) -> impl Stream<Item = Result<StreamEvent>> {
    decode_event_stream(Box::pin(response.bytes_stream()))
}
