//! # docchat
//!
//! A document ingestion and hybrid-retrieval engine for
//! chat-with-your-documents tools.
//!
//! docchat ingests heterogeneous documents (PDF, plain text, Word,
//! spreadsheets) and fetched web pages into per-namespace libraries,
//! maintains a persistent, incrementally-updated semantic index with a
//! lexical side channel, and answers natural-language questions by fusing
//! both rankings before handing context to a generative answer provider.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────┐   ┌─────────────┐
//! │ docs/ + URLs │──▶│ Extract→Chunk      │──▶│  Store      │
//! │ per namespace│   │ →Dedupe→Embed      │   │ SQLite      │
//! └──────────────┘   └───────────────────┘   │ vectors+FTS │
//!        ▲                    │               └──────┬──────┘
//!        │              manifest append               │
//!   OCR fallback                              ┌──────┴──────┐
//!   (garbled PDFs)                            │ Rank fusion │
//!                                             │ sem ⊕ lex   │
//!                                             └──────┬──────┘
//!                                                    ▼
//!                                             answer provider
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docchat sync                        # index everything in docs/
//! docchat fetch https://example.com --crawl
//! docchat search "capacity in 2023"
//! docchat ask "What is the capacity in 2023?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and operation reports |
//! | [`error`] | Per-item pipeline error taxonomy |
//! | [`extract`] | Multi-format extraction with OCR fallback |
//! | [`ocr`] | OCR provider contract |
//! | [`chunk`] | Separator-priority chunking |
//! | [`dedupe`] | Fingerprint deduplication |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`store`] | Vector store + lexical index |
//! | [`manifest`] | Durable membership manifests |
//! | [`sync`] | Incremental index synchronization |
//! | [`retrieve`] | Hybrid rank fusion |
//! | [`analyze`] | Query analysis and weighting |
//! | [`answer`] | Answer generation from context |
//! | [`fetch`] | Page fetching and crawling |

pub mod analyze;
pub mod answer;
pub mod chunk;
pub mod config;
pub mod dedupe;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod manifest;
pub mod models;
pub mod ocr;
pub mod retrieve;
pub mod store;
pub mod sync;
