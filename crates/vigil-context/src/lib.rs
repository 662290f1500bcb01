//! Bounded evidence-bundle assembly for the review loop.
//!
//! Builds the context sent to the reviewer: the full diff plus
//! boundary-snapped windows of head file content around every changed range,
//! with on-demand expansion under hard file/line caps and token-budget
//! truncation that drops the least-changed files first.

pub mod assembler;
pub mod boundary;

pub use assembler::{
    assemble, estimate_tokens, expand, ContextBundle, ContextPolicy, ExpandReason,
    ExpansionOutcome, FileWindow,
};
pub use boundary::enclosing_span;
