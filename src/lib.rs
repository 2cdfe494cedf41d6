//! # PDF RAG
//!
//! Upload a PDF, index it for semantic search, and hold a conversation about
//! its contents over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ /upload  │──▶│ Index queue  │──▶│ Extract → Chunk →   │
//! │          │   │ (workers)    │   │ Embed → VectorIndex │
//! └──────────┘   └──────┬───────┘   └─────────┬──────────┘
//!                       │ Ready / Failed       │ save
//!                       ▼                      ▼
//!                ┌──────────────┐       ┌──────────────┐
//! ┌──────────┐   │ SessionStore │◀──────│ vectorstores │
//! │  /chat   │──▶│ (chains)     │ rehydrate            │
//! └──────────┘   └──────────────┘       └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=sk-...
//! pdf-rag serve                                 # start HTTP server
//! pdf-rag index ./handbook.pdf                  # index locally, prints a session id
//! pdf-rag ask <session_id> "What is covered?"   # one question against a saved index
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`extract`] | Per-page text extraction |
//! | [`chunk`] | Recursive character splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`llm`] | Chat model provider abstraction |
//! | [`vector_index`] | In-memory similarity index with on-disk persistence |
//! | [`indexer`] | Upload → index pipeline |
//! | [`chain`] | Conversational retrieval chain and binder |
//! | [`session`] | Session registry |
//! | [`queue`] | Background indexing workers |
//! | [`auth`] | Bearer token verification and role checks |
//! | [`server`] | HTTP server |

pub mod auth;
pub mod chain;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod extract;
pub mod indexer;
pub mod llm;
pub mod models;
pub mod queue;
pub mod server;
pub mod session;
pub mod vector_index;
