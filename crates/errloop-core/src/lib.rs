//! errloop-core: Core library for errloop
//!
//! This crate turns observed command failures into prevention rules for an
//! AI coding agent's shell tool.
//!
//! # Architecture
//!
//! ```text
//! host hooks → Capture → Ledger (errors.jsonl, append-only)
//!                            ↓
//!        Signature → Cluster → Synthesizer → learned pack
//!                                                ↓
//!                  builtin / learned / custom packs → Merger → active.json
//!                                                                 ↓
//!                                    candidate command → Match Engine → Verdict
//! ```
//!
//! # Modules
//!
//! - `signature`: cause classification and signature extraction
//! - `event`: ledger record types (failures and fixes)
//! - `ledger`: append-only event store, lazy reader and fix linking
//! - `cluster`: per-signature evidence aggregation
//! - `synth`: promotion of clusters into learned rules
//! - `model`: rule, pack and allowlist file schemas
//! - `packs`: pack resolution, built-in packs and precedence merge
//! - `matcher`: allowlist + ruleset evaluation with fail-open verdicts
//! - `capture`: failure and fix capture from host payloads
//! - `curate`: end-to-end curation pass and review listing
//! - `hook`: host trigger payloads and dispatch
//! - `config` / `workspace`: configuration and resolved paths
//! - `lock`: exclusive file locking and atomic rewrites
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod capture;
pub mod cluster;
pub mod config;
pub mod curate;
pub mod error;
pub mod event;
pub mod hook;
pub mod ledger;
pub mod lock;
pub mod logging;
pub mod matcher;
pub mod model;
pub mod packs;
pub mod signature;
pub mod synth;
pub mod workspace;

pub use error::{Error, Result};

/// Crate version, recorded in lock metadata and generated files.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
