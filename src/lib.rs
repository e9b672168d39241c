//! # Zimi
//!
//! **An offline knowledge server over Kiwix ZIM archives.**
//!
//! Point Zimi at a directory of ZIM files (Wikipedia, Stack Exchange,
//! developer docs, ...) and it serves a JSON HTTP API for cross-archive
//! search, article reading, title autocomplete, and library management
//! (browse the Kiwix catalog, download, update, delete), plus scoped
//! "collections" of archives.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌─────────────┐
//! │ *.zim dir │──▶│   Registry   │──▶│ Title index │
//! │           │   │ (native      │   │ SQLite+FTS5 │
//! └───────────┘   │  handles)    │   │  per archive│
//!                 └──────┬───────┘   └──────┬──────┘
//!                        │                  │
//!                 ┌──────▼──────────────────▼──────┐
//!                 │   Search engine (two-phase)    │
//!                 │ title fan-out ─▶ deep verify   │
//!                 └──────────────┬─────────────────┘
//!                                │
//!                        ┌───────▼────────┐
//!                        │  HTTP (Axum)   │
//!                        └────────────────┘
//! ```
//!
//! ## Request Flow
//!
//! A search hits the result cache first; on a miss the engine fans out
//! per-archive title lookups in parallel (phase 1, 800 ms budget), then
//! walks archives serially under the global native lock verifying
//! candidates against article bodies (phase 2). Merged hits are scored,
//! deduplicated, ordered deterministically, and only the final page gets
//! snippets and thumbnails. Downloads stream to `.tmp` files with Range
//! resume, then trigger a library refresh and an index rebuild.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-driven configuration |
//! | [`error`] | Typed error kinds with the HTTP error contract |
//! | [`archive`] | Archive registry, native handles, locks, metadata |
//! | [`title_index`] | Per-archive SQLite prefix/FTS store |
//! | [`search`] | Two-phase engine, ranking, dedup, caches |
//! | [`cache`] | TTL'd LRU building blocks |
//! | [`reader`] | HTML-to-text, snippets, MIME fallbacks |
//! | [`resolve`] | Cross-archive URL resolution |
//! | [`catalog`] | Kiwix OPDS catalog client, update detection |
//! | [`download`] | Resumable downloads with retry and cancellation |
//! | [`rate_limit`] | Per-IP sliding-window limiter |
//! | [`metrics`] | Request counters and latency histogram |
//! | [`state`] | Persistent JSON state with atomic writes |
//! | [`app`] | Wiring and background workers |
//! | [`server`] | Axum router and endpoints |

pub mod app;
pub mod archive;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod download;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod reader;
pub mod resolve;
pub mod search;
pub mod server;
pub mod state;
pub mod title_index;
