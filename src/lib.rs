//! # Insight Sync
//!
//! A synchronization-and-search service that keeps a vector index
//! convergent with a source-of-truth record store and serves semantic
//! search with optional LLM summaries over the indexed documents.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────────┐   ┌─────────────┐
//! │   Source   │──▶│   Reconciler    │──▶│ Vector index │
//! │ repository │   │ fingerprint +  │   │ kNN + filter │
//! └────────────┘   │ embed + write  │   └──────┬──────┘
//!                  └────────────────┘          │
//!                                     ┌────────┴────────┐
//!                                     ▼                 ▼
//!                               ┌──────────┐      ┌──────────┐
//!                               │   CLI    │      │   HTTP   │
//!                               │ (isync)  │      │  (axum)  │
//!                               └──────────┘      └──────────┘
//! ```
//!
//! The source repository owns the records; the index is a derived,
//! disposable copy. Syncs compare per-record fingerprints and upsert,
//! delete, or skip accordingly; a full sync additionally removes indexed
//! documents whose id no longer exists in the source. Search embeds the
//! query, runs filtered kNN with a total ordering (score, then
//! fingerprint, then id), and optionally asks an LLM for a best-effort
//! summary of the top hits.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Closed error taxonomy |
//! | [`source`] | Source-of-truth repository abstraction |
//! | [`index`] | Vector index abstraction and in-memory backend |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`summarize`] | Summarization provider abstraction |
//! | [`retry`] | Shared retry/backoff/timeout plumbing |
//! | [`writer`] | Embeds records and writes indexed documents |
//! | [`reconciler`] | Sync scopes, in-flight collapsing, orphan removal |
//! | [`engine`] | Query validation, kNN retrieval, summaries |
//! | [`jobs`] | Bounded background job registry |
//! | [`service`] | Orchestrator facade |
//! | [`server`] | HTTP API |

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod index;
pub mod jobs;
pub mod models;
pub mod reconciler;
pub mod retry;
pub mod server;
pub mod service;
pub mod source;
pub mod summarize;
pub mod writer;
