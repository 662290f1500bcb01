//! Core types, configuration, and error handling for the Vigil platform.
//!
//! This crate provides the shared foundation used by all other Vigil crates:
//! - [`VigilError`] — unified error type using `thiserror`
//! - [`VigilConfig`] — configuration loaded from `.vigil.toml`
//! - Schema types: [`Issue`], [`ReviewResult`], [`EvalResult`], and the
//!   [`Severity`] / [`Category`] / [`Language`] / [`ReviewStatus`] enums
//! - [`compute_review_id`] — deterministic run identity

mod config;
mod error;
mod types;

pub use config::{BudgetProfile, GithubConfig, LlmConfig, OutputConfig, VigilConfig};
pub use error::VigilError;
pub use types::{
    build_dedupe_key, compute_review_id, dedupe_key_is_valid, evidence_snippet_is_valid, Category,
    EvalResult, Issue, Language, ReviewResult, ReviewStats, ReviewStatus, Severity,
};

/// A convenience `Result` type for Vigil operations.
pub type Result<T> = std::result::Result<T, VigilError>;
