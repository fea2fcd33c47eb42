//! # AskMyNotes
//!
//! A grounded question-answering engine over per-subject study notes.
//!
//! Students upload notes (PDF, DOCX, PPTX, XLSX, Markdown, plain text) into
//! a subject. Questions are answered only from that subject's passages, and
//! every answer carries a confidence label, citations and evidence snippets.
//! When the notes do not cover a question the engine says so instead of
//! guessing.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │  Document  │──▶│  Retriever  │──▶│  Synthesizer │──▶│ Confidence │
//! │   Store    │   │ lex/sem/hyb │   │ extr / gen   │   │ + citations│
//! └─────┬──────┘   └─────────────┘   └──────────────┘   └─────┬──────┘
//!       │ SQLite                                              │
//!       ▼                                                     ▼
//!   documents,                                   ┌──────────┐  ┌──────────┐
//!   passages, vectors                            │   CLI    │  │   HTTP   │
//!                                                │ (notes)  │  │  (axum)  │
//!                                                └──────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error kinds |
//! | [`text`] | Normalization, tokenization, sentence splitting |
//! | [`extract`] | Format detection and text extraction |
//! | [`chunk`] | Passage chunking with overlap |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Per-subject document store with SQLite persistence |
//! | [`retrieve`] | Lexical, semantic and hybrid retrieval |
//! | [`synthesize`] | Extractive and generative answer synthesis |
//! | [`classify`] | Confidence labels, citations and evidence |
//! | [`engine`] | The end-to-end answer engine |
//! | [`ingest`] | Bulk ingestion from local paths |
//! | [`cli`] | `notes` command implementations |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod remote;
pub mod retrieve;
pub mod server;
pub mod store;
pub mod synthesize;
pub mod text;
