//! # Remedy Harness
//!
//! Retrieval-backed herbal remedy recommendations with generated
//! explanations.
//!
//! A symptom description is matched to one row of a delimited-text knowledge
//! base (semantic search over a persisted vector index, then lexical
//! fallbacks). The matched row is explained in eight fixed sections by a
//! hosted or open-model text generator, backfilled by a deterministic
//! template when the generator fails or answers incompletely.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ RecordStore │──▶│ IndexManager │──▶│   SQLite     │
//! │   (CSV)     │   │ embed+persist│   │ docs + meta  │
//! └──────┬──────┘   └──────┬───────┘   └──────────────┘
//!        │                 ▼
//!        │          ┌──────────────┐   ┌──────────────┐
//!        └─────────▶│  Retriever   │──▶│    Engine    │◀── ProviderGate
//!                   └──────────────┘   └──────┬───────┘
//!                                  ┌──────────┴──────────┐
//!                                  ▼                     ▼
//!                             ┌──────────┐         ┌──────────┐
//!                             │   CLI    │         │   HTTP   │
//!                             │ (remedy) │         │  (axum)  │
//!                             └──────────┘         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! remedy index rebuild                   # embed the knowledge base
//! remedy recommend "j'ai le paludisme"   # match + explain
//! remedy provider set openai             # uses OPENAI_API_KEY
//! remedy serve                           # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Records, sections, request/response types |
//! | [`records`] | In-memory knowledge base |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Vector index build, persistence, staleness |
//! | [`retriever`] | Semantic → keyword → raw text → topic default |
//! | [`provider`] | Text generators and the provider gate |
//! | [`prompt`] | Prompt template and section extraction |
//! | [`fallback`] | Templated sections and canned chat replies |
//! | [`fields`] | Display strings derived from a record |
//! | [`recommend`] | The [`recommend::Engine`] orchestrator |
//! | [`chat`] | Open-ended chat flow |
//! | [`server`] | HTTP adapter |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Boundary error type |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod fallback;
pub mod fields;
pub mod index;
pub mod migrate;
pub mod models;
pub mod prompt;
pub mod provider;
pub mod records;
pub mod recommend;
pub mod retriever;
pub mod server;
