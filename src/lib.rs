//! # agentmux
//!
//! Uniform streaming driver for interchangeable AI coding-agent CLIs.
//!
//! A host application issues a query; agentmux spawns the chosen backend's
//! process, translates its idiosyncratic stdout protocol into one canonical
//! event stream, and relays permission decisions and cancellation back to
//! the process. Callers never need to know which backend produced an event.
//!
//! ## Architecture
//!
//! ```text
//!   caller ── Registry::get(id) ── Backend::query(request)
//!                                        │
//!                                        ▼
//!                          spawn process ── stdout line buffer
//!                                        │
//!                                        ▼
//!                          per-line parse ── shape normalizer
//!                                        │
//!                                        ▼
//!                          canonical AgentEvent stream ── caller
//! ```
//!
//! Permission responses flow the other way: caller →
//! `Backend::respond_to_permission` → process stdin.
//!
//! ## Modules
//! - `backend`: the adapter contract, the three backend adapters, and the
//!   registry
//! - `config`: environment-driven configuration

pub mod backend;
pub mod config;

pub use backend::events::{AgentEvent, ContentBlock, QueryOutcome, Usage};
pub use backend::registry::{BackendRegistry, RegistryError, DEFAULT_BACKEND};
pub use backend::{
    Backend, BackendIdentity, BackendInfo, EventStream, PermissionMode, PermissionResponse,
    QueryRequest,
};
pub use config::{Config, ConfigError};
