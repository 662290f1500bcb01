//! Bounded review orchestration: budget tracking, the draft/verify/escalate
//! loop, reviewer and linter capability seams, and the idempotent output
//! writer.

pub mod budget;
pub mod capability;
pub mod llm;
pub mod orchestrator;
pub mod output;
pub mod prompt;
pub mod telemetry;

pub use budget::{BudgetDimension, BudgetState, BudgetTracker, Reservation};
pub use capability::{
    DraftReview, InstructionVariant, LintFinding, LintOutcome, Linter, Reviewer,
};
pub use llm::ChatReviewer;
pub use orchestrator::Orchestrator;
pub use output::{
    build_comment_body, publish, render_markdown, write_artifacts, CommentApi, OctocrabComments,
    PrComment, PublishAction, PublishReceipt, COMMENT_MARKER_PREFIX,
};
pub use telemetry::RunTelemetry;
