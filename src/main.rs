//! # docent CLI
//!
//! ## Usage
//!
//! ```bash
//! docent --config ./config/docent.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docent init` | Create the database, run migrations, seed assistants |
//! | `docent serve` | Start the HTTP API |
//! | `docent ingest text <assistant> <path>` | Ingest a text file (`-` for stdin) |
//! | `docent ingest pdf <assistant> <path>` | Ingest a PDF |
//! | `docent ingest url <assistant> <url>` | Fetch and ingest a web page |
//! | `docent ask <assistant> "<question>"` | Answer locally, `--stream` for live output |
//! | `docent session <assistant>` | Open a chat session |
//! | `docent chat <assistant> "<question>"` | Ask a running server over its event stream |

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use docent::config;
use docent::ingest::IngestRequest;
use docent::models::{RetrievedPassage, SourceKind};
use docent::server::{self, AppState};
use docent::store::{SqliteStore, Store};
use docent::transport::{read_event_stream, StreamEvent};
use docent::{db, migrate};

/// docent: retrieval-augmented assistants over namespaced knowledge bases.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docent.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docent",
    about = "Retrieval-augmented assistants over namespaced knowledge bases",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and seed the configured assistants.
    ///
    /// Idempotent: existing assistants are updated in place.
    Init,

    /// Start the HTTP API on `[server].bind`.
    Serve,

    /// Ingest a document into an assistant's knowledge base.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Answer a question without going through the server.
    Ask {
        assistant: String,
        question: String,

        /// Persist the exchange in this session.
        #[arg(long)]
        session: Option<String>,

        /// Print fragments as they are generated.
        #[arg(long)]
        stream: bool,
    },

    /// Open a chat session and print its id.
    Session { assistant: String },

    /// Ask a running server and print its event stream.
    Chat {
        assistant: String,
        question: String,

        #[arg(long)]
        session: Option<String>,

        /// Base URL of the server.
        #[arg(long, default_value = "http://127.0.0.1:7341")]
        url: String,
    },
}

#[derive(Subcommand)]
enum IngestSource {
    /// A UTF-8 text file, or `-` for stdin.
    Text {
        assistant: String,
        path: PathBuf,

        /// Document name (defaults to the file name).
        #[arg(long)]
        name: Option<String>,

        /// Record the text as coming from this URL.
        #[arg(long)]
        source_url: Option<String>,
    },

    /// A PDF file.
    Pdf { assistant: String, path: PathBuf },

    /// A web page.
    Url {
        assistant: String,
        url: String,

        #[arg(long)]
        title: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docent=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // The remote client needs no local configuration.
    if let Commands::Chat {
        assistant,
        question,
        session,
        url,
    } = &cli.command
    {
        return run_remote_chat(url, assistant, question, session.as_deref()).await;
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let store = SqliteStore::new(pool);
            let seeded = migrate::seed_assistants(&store, &cfg.assistants).await?;
            println!("Database initialized successfully ({} assistants seeded).", seeded);
            for assistant in store.list_assistants().await? {
                println!("  {}  {}", assistant.id, assistant.name);
            }
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Ingest { source } => {
            let state = AppState::build(&cfg).await?;
            run_ingest(&state, source).await?;
        }
        Commands::Ask {
            assistant,
            question,
            session,
            stream,
        } => {
            let state = AppState::build(&cfg).await?;
            if stream {
                let events = state.engine().answer_stream(question, assistant, session);
                print_events(events.map(Ok)).await?;
            } else {
                let answer = state
                    .engine()
                    .answer(&question, &assistant, session.as_deref())
                    .await?;
                println!("{}", answer.response);
                print_sources(&answer.retrieved_passages);
            }
        }
        Commands::Session { assistant } => {
            let state = AppState::build(&cfg).await?;
            let session_id = state.engine().create_session(&assistant).await?;
            println!("{}", session_id);
        }
        Commands::Chat { .. } => unreachable!("handled before loading config"),
    }

    Ok(())
}

async fn run_ingest(state: &AppState, source: IngestSource) -> anyhow::Result<()> {
    match source {
        IngestSource::Text {
            assistant,
            path,
            name,
            source_url,
        } => {
            let text = if path.as_os_str() == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?
            };
            let name = name.unwrap_or_else(|| file_name_of(&path, "stdin"));
            let kind = if source_url.is_some() {
                SourceKind::Website
            } else {
                SourceKind::Text
            };
            let mut request = IngestRequest::new(assistant, name, kind)
                .with_mime_type("text/plain")
                .with_file_size(text.len() as i64);
            if let Some(url) = source_url {
                request = request.with_source_url(url);
            }
            let outcome = state.pipeline().ingest_text(&text, request).await?;
            println!(
                "Ingested document {}: {} chunks created",
                outcome.document_id, outcome.chunks_created
            );
        }
        IngestSource::Pdf { assistant, path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let outcome = state
                .ingest_pdf(&assistant, file_name_of(&path, "document.pdf"), None, bytes)
                .await?;
            println!(
                "Ingested document {}: {} chunks created ({} characters extracted)",
                outcome.document_id, outcome.chunks_created, outcome.extracted_chars
            );
        }
        IngestSource::Url {
            assistant,
            url,
            title,
        } => {
            let (outcome, title) = state
                .ingest_website(&assistant, &url, title.as_deref())
                .await?;
            println!(
                "Ingested \"{}\" as document {}: {} chunks created",
                title, outcome.document_id, outcome.chunks_created
            );
        }
    }
    Ok(())
}

async fn run_remote_chat(
    base_url: &str,
    assistant: &str,
    question: &str,
    session: Option<&str>,
) -> anyhow::Result<()> {
    let response = reqwest::Client::new()
        .post(format!("{}/api/chat/stream", base_url.trim_end_matches('/')))
        .json(&serde_json::json!({
            "message": question,
            "assistantId": assistant,
            "sessionId": session,
        }))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", base_url))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("server returned {}: {}", status, body);
    }

    print_events(read_event_stream(response)).await
}

/// Print fragments as they arrive, then the sources of the first fragment.
async fn print_events<S>(events: S) -> anyhow::Result<()>
where
    S: futures::Stream<Item = docent::error::Result<StreamEvent>>,
{
    let mut events = Box::pin(events);
    let mut sources: Option<Vec<RetrievedPassage>> = None;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        match event? {
            StreamEvent::Fragment {
                content,
                retrieved_passages,
            } => {
                write!(stdout, "{}", content)?;
                stdout.flush()?;
                sources.get_or_insert(retrieved_passages);
            }
            StreamEvent::Done => break,
            StreamEvent::Error { error } => {
                println!();
                anyhow::bail!("answer failed: {}", error);
            }
        }
    }
    println!();
    print_sources(sources.as_deref().unwrap_or_default());
    Ok(())
}

fn print_sources(passages: &[RetrievedPassage]) {
    if passages.is_empty() {
        return;
    }
    println!("\nSources:");
    for (i, passage) in passages.iter().enumerate() {
        let name = passage
            .metadata
            .get("fileName")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        println!("  [{}] {} (score {:.3})", i + 1, name, passage.score);
    }
}

fn file_name_of(path: &std::path::Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback.to_string())
}
