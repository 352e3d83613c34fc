//! # Docshelf
//!
//! A local-first intake pipeline for a pile of business documents.
//!
//! Docshelf walks the folders it is pointed at, fingerprints every file,
//! groups byte-identical copies, converts the rest to markdown, asks a
//! language model for a short brief, and files each document along three
//! axes (topic, usage, client) as symlink views. All progress lives in a
//! SQLite index, so every step resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌──────────┐
//! │ Discover │──▶│  Index   │──▶│ Convert │──▶│ Summarize │──▶│ Classify │
//! │ + Hash   │   │  SQLite  │   │ → .md   │   │  → brief  │   │ → views  │
//! └──────────┘   └──────────┘   └─────────┘   └───────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shelf init                     # create the index
//! shelf scan ~/Documents --dry-run
//! shelf run ~/Documents          # scan, convert, summarize, classify
//! shelf status
//! shelf label ~/Documents/q3.pdf --axis topic --category finance
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Stages, formats, labels, document records |
//! | [`fingerprint`] | SHA-256 content hashing |
//! | [`discover`] | Directory walking and filtering |
//! | [`index`] | Scan, deduplication, index validation |
//! | [`store`] | Index persistence (SQLite and in-memory) |
//! | [`extract`] | Built-in text extraction per format |
//! | [`convert`] | Converter backends |
//! | [`llm`] | Language model backends and the request gate |
//! | [`stages`] | Conversion, summarization, classification |
//! | [`views`] | Symlink views per axis and category |
//! | [`pipeline`] | Orchestration of scan and stages |
//! | [`report`] | Run reports and dry-run previews |
//! | [`status`] | Index overview |
//! | [`export`] | JSON export |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod convert;
pub mod db;
pub mod discover;
pub mod error;
pub mod export;
pub mod extract;
pub mod fingerprint;
pub mod index;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod report;
pub mod stages;
pub mod status;
pub mod store;
pub mod views;
