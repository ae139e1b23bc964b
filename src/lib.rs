//! # docent
//!
//! Retrieval-augmented assistants over namespaced knowledge bases.
//!
//! Each assistant owns a namespace in a vector index. Documents (pasted
//! text, PDFs, web pages) are chunked, embedded in batches and upserted
//! into that namespace; questions are embedded, matched against the top
//! passages and answered by a language model, either in one response or as
//! a stream of `data: <JSON>` events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────┐   ┌──────────────┐
//! │ Loaders  │──▶│  Chunker  │──▶│  Embedder  │──▶│ Vector index │
//! │ PDF/Web  │   │ (profile) │   │ (batched)  │   │ (namespace)  │
//! └──────────┘   └───────────┘   └────────────┘   └──────┬───────┘
//!                                                        │ top-K
//!                ┌────────────┐   ┌────────────┐          ▼
//!                │ SSE frames │◀──│  Generator │◀── Query engine
//!                └────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docent init                                  # create database, seed assistants
//! docent ingest text general notes.txt         # ingest a file as text
//! docent ask general "What colour is the sky?" --stream
//! docent serve                                 # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error kinds |
//! | [`chunk`] | Text chunking |
//! | [`embedding`] | Batched embedding with rate-limit retry |
//! | [`index`] | Namespaced vector index gateway |
//! | [`loader`] | PDF, web page and text loaders |
//! | [`ingest`] | Ingestion pipeline |
//! | [`generation`] | Chat completion backends |
//! | [`query`] | Question answering, streaming and not |
//! | [`transport`] | Event-stream framing and decoding |
//! | [`store`] | Relational records |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations and assistant seeding |

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod loader;
pub mod migrate;
pub mod models;
pub mod query;
pub mod server;
pub mod store;
pub mod transport;
