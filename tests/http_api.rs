use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use docent::db;
use docent::embedding::{BatchEmbedder, EmbedMode, EmbeddingProvider};
use docent::error::Result;
use docent::generation::{Generator, TokenStream};
use docent::index::MemoryIndex;
use docent::ingest::IngestionPipeline;
use docent::migrate;
use docent::models::Assistant;
use docent::query::{QueryEngine, NO_CONTENT_RESPONSE};
use docent::server::{self, AppState};
use docent::store::{SqliteStore, Store};
use docent::transport::{read_event_stream, StreamEvent, EVENT_STREAM_MIME};

const MAX_UPLOAD: usize = 2 * 1024 * 1024;

/// Letter-frequency vectors: texts sharing letters score close together.
struct LetterEmbeddings;

#[async_trait]
impl EmbeddingProvider for LetterEmbeddings {
    fn model_name(&self) -> &str {
        "letters"
    }

    async fn embed_batch(&self, texts: &[String], _mode: EmbedMode) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 27];
                for c in text.to_ascii_lowercase().chars() {
                    match c {
                        'a'..='z' => v[(c as u8 - b'a') as usize] += 1.0,
                        _ => v[26] += 0.1,
                    }
                }
                v
            })
            .collect())
    }
}

struct CannedGenerator {
    fragments: Vec<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl Generator for CannedGenerator {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fragments.concat())
    }

    async fn stream(&self, _prompt: &str) -> Result<TokenStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<Result<String>> = self.fragments.iter().map(|f| Ok(f.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    generator: Arc<CannedGenerator>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let response = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }

    async fn upload_sky(&self) {
        let (status, body) = self
            .post(
                "/api/upload/text",
                json!({ "text": "The sky is blue.", "assistantId": "general" }),
            )
            .await;
        assert_eq!(status, 200, "{}", body);
    }
}

async fn start_server() -> TestServer {
    let pool = db::connect_in_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
    store
        .upsert_assistant(&Assistant {
            id: "general".into(),
            name: "General Assistant".into(),
            description: "General knowledge".into(),
            system_prompt: "You are a helpful assistant.".into(),
            created_at: 1,
        })
        .await
        .unwrap();

    let embedder = Arc::new(
        BatchEmbedder::new(Arc::new(LetterEmbeddings)).with_batch_delay(Duration::ZERO),
    );
    let index = Arc::new(MemoryIndex::new());
    let generator = Arc::new(CannedGenerator {
        fragments: vec!["The sky", " is", " blue."],
        calls: AtomicUsize::new(0),
    });

    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        embedder.clone(),
        index.clone(),
        Default::default(),
    ));
    let engine = Arc::new(QueryEngine::new(
        store.clone(),
        embedder,
        index,
        generator.clone(),
    ));
    let state = AppState::new(store, pipeline, engine, reqwest::Client::new(), MAX_UPLOAD);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, state));

    TestServer {
        addr,
        client: reqwest::Client::new(),
        generator,
    }
}

#[tokio::test]
async fn test_health() {
    let server = start_server().await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_text_upload_creates_completed_document() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/api/upload/text",
            json!({ "text": "The sky is blue.", "assistantId": "general" }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["success"], true);
    assert_eq!(body["chunksCreated"], 1);
    assert_eq!(body["message"], "Text processed successfully: 1 chunks created");

    let (_, listing) = server.get("/api/assistants/general/documents").await;
    let docs = listing["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["fileName"], "pasted-text");
    assert_eq!(docs[0]["sourceKind"], "text");
    assert_eq!(docs[0]["status"], "completed");
    assert_eq!(docs[0]["chunks"], 1);
    assert!(docs[0].get("originalText").is_none());

    let (_, assistants) = server.get("/api/assistants").await;
    let general = &assistants["assistants"][0];
    assert_eq!(general["id"], "general");
    assert_eq!(general["documentCount"], 1);
    assert_eq!(general["documents"][0]["id"], body["documentId"]);
}

#[tokio::test]
async fn test_text_upload_with_source_url_is_website() {
    let server = start_server().await;
    let (status, _) = server
        .post(
            "/api/upload/text",
            json!({
                "text": "Clipped article text.",
                "assistantId": "general",
                "fileName": "clip",
                "sourceUrl": "https://example.com/a",
            }),
        )
        .await;
    assert_eq!(status, 200);
    let (_, listing) = server.get("/api/assistants/general/documents").await;
    assert_eq!(listing["documents"][0]["sourceKind"], "website");
    assert_eq!(listing["documents"][0]["sourceUrl"], "https://example.com/a");
}

#[tokio::test]
async fn test_upload_validation_errors() {
    let server = start_server().await;

    let (status, body) = server
        .post("/api/upload/text", json!({ "text": "hello" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, body) = server
        .post(
            "/api/upload/text",
            json!({ "text": "hello", "assistantId": "nobody" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "not_found");

    let response = server
        .client
        .post(server.url("/api/upload/text"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
}

#[tokio::test]
async fn test_oversized_pdf_rejected_without_document() {
    let server = start_server().await;
    let mut bytes = b"%PDF-1.4\n".to_vec();
    bytes.resize(3 * 1024 * 1024, b' ');

    let form = reqwest::multipart::Form::new()
        .text("assistantId", "general")
        .part(
            "file",
            reqwest::multipart::Part::bytes(bytes)
                .file_name("big.pdf")
                .mime_str("application/pdf")
                .unwrap(),
        );
    let response = server
        .client
        .post(server.url("/api/upload/document"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let (_, listing) = server.get("/api/assistants/general/documents").await;
    assert!(listing["documents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_non_pdf_upload_rejected() {
    let server = start_server().await;
    let form = reqwest::multipart::Form::new()
        .text("assistantId", "general")
        .part(
            "file",
            reqwest::multipart::Part::bytes(b"just text".to_vec())
                .file_name("notes.txt")
                .mime_str("text/plain")
                .unwrap(),
        );
    let response = server
        .client
        .post(server.url("/api/upload/document"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    let (_, listing) = server.get("/api/assistants/general/documents").await;
    assert!(listing["documents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_website_with_malformed_url_rejected() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/api/upload/website",
            json!({ "url": "not a url", "assistantId": "general" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_chat_without_documents_falls_back() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/api/chat",
            json!({ "message": "What colour is the sky?", "assistantId": "general" }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["response"], NO_CONTENT_RESPONSE);
    assert!(body["retrievedPassages"].as_array().unwrap().is_empty());
    assert_eq!(server.generator.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_chat_answers_and_persists_in_session() {
    let server = start_server().await;
    server.upload_sky().await;

    let (status, session) = server
        .post("/api/session", json!({ "assistantId": "general" }))
        .await;
    assert_eq!(status, 200);
    let session_id = session["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("session_"));

    let (status, body) = server
        .post(
            "/api/chat",
            json!({
                "message": "What colour is the sky?",
                "assistantId": "general",
                "sessionId": session_id,
            }),
        )
        .await;
    assert_eq!(status, 200, "{}", body);
    assert_eq!(body["response"], "The sky is blue.");
    assert_eq!(body["sessionId"], session_id.as_str());
    let passages = body["retrievedPassages"].as_array().unwrap();
    assert_eq!(passages.len(), 1);
    assert_eq!(passages[0]["content"], "The sky is blue.");

    let (_, messages) = server
        .get(&format!("/api/sessions/{}/messages", session_id))
        .await;
    let messages = messages["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["retrievedPassages"][0]["content"], "The sky is blue.");

    let (_, chats) = server.get("/api/assistants/general/chats").await;
    assert_eq!(chats["chats"][0]["title"], "What colour is the sky?");
}

#[tokio::test]
async fn test_unknown_ids_are_client_errors() {
    let server = start_server().await;
    let (status, body) = server.get("/api/sessions/session_missing/messages").await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = server.get("/api/assistants/nobody/documents").await;
    assert_eq!(status, 400);

    let (status, _) = server
        .post("/api/session", json!({ "assistantId": "nobody" }))
        .await;
    assert_eq!(status, 400);
}

async fn stream_events(server: &TestServer, body: Value) -> Vec<StreamEvent> {
    let response = server
        .client
        .post(server.url("/api/chat/stream"))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with(EVENT_STREAM_MIME));
    read_event_stream(response)
        .map(|event| event.unwrap())
        .collect()
        .await
}

#[tokio::test]
async fn test_stream_matches_chat_response() {
    let server = start_server().await;
    server.upload_sky().await;

    let events = stream_events(
        &server,
        json!({ "message": "What colour is the sky?", "assistantId": "general" }),
    )
    .await;

    assert_eq!(events.last(), Some(&StreamEvent::Done));
    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Fragment { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "The sky is blue.");
    match &events[0] {
        StreamEvent::Fragment {
            retrieved_passages, ..
        } => assert_eq!(retrieved_passages[0].content, "The sky is blue."),
        other => panic!("expected a fragment, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_failure_is_terminal_event() {
    let server = start_server().await;
    let events = stream_events(
        &server,
        json!({ "message": "Anyone there?", "assistantId": "nobody" }),
    )
    .await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { error } => assert!(error.contains("not found")),
        other => panic!("expected an error event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_rejects_missing_message_before_streaming() {
    let server = start_server().await;
    let (status, body) = server
        .post("/api/chat/stream", json!({ "assistantId": "general" }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}
