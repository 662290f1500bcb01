//! Hard resource ceilings for one review run.
//!
//! Every spend-incurring operation reserves before executing; a denial is
//! non-retryable for that attempt and forces the loop to finalize as
//! truncated. Wall time is checked against elapsed-since-start before every
//! reservation, whatever dimension is being reserved.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;
use vigil_core::BudgetProfile;

/// A budgeted resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDimension {
    LlmCalls,
    ToolCalls,
    WallTime,
    Cost,
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetDimension::LlmCalls => write!(f, "llm_calls"),
            BudgetDimension::ToolCalls => write!(f, "tool_calls"),
            BudgetDimension::WallTime => write!(f, "wall_time"),
            BudgetDimension::Cost => write!(f, "cost_usd"),
        }
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    /// Names the dimension that refused; non-retryable for this attempt.
    Denied(BudgetDimension),
}

impl Reservation {
    pub fn is_granted(self) -> bool {
        matches!(self, Reservation::Granted)
    }
}

/// Serializable counters for telemetry and stats.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BudgetState {
    pub llm_calls_used: u32,
    pub tool_calls_used: u32,
    pub elapsed_seconds: f64,
    pub cost_usd_used: f64,
}

/// Resource ledger for a single review run.
///
/// Limits are hard ceilings, not soft targets: `used <= limit` holds on
/// every dimension at every observation point, and no retry may exceed a
/// limit even by one unit. One tracker per run; concurrent runs each carry
/// their own.
///
/// # Examples
///
/// ```
/// use vigil_core::BudgetProfile;
/// use vigil_review::budget::{BudgetDimension, BudgetTracker, Reservation};
///
/// let mut tracker = BudgetTracker::new(BudgetProfile::default());
/// assert_eq!(tracker.reserve(BudgetDimension::LlmCalls, 1.0), Reservation::Granted);
/// assert_eq!(tracker.remaining(BudgetDimension::LlmCalls), 1.0);
/// ```
pub struct BudgetTracker {
    profile: BudgetProfile,
    started_at: Instant,
    llm_calls_used: u32,
    tool_calls_used: u32,
    cost_usd_used: f64,
}

impl BudgetTracker {
    pub fn new(profile: BudgetProfile) -> Self {
        Self {
            profile,
            started_at: Instant::now(),
            llm_calls_used: 0,
            tool_calls_used: 0,
            cost_usd_used: 0.0,
        }
    }

    /// The profile this tracker enforces.
    pub fn profile(&self) -> &BudgetProfile {
        &self.profile
    }

    fn elapsed_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Attempt to reserve `amount` of a dimension, committing it on grant.
    ///
    /// Wall time is evaluated first regardless of the requested dimension, so
    /// an over-time run cannot spend anything further.
    pub fn reserve(&mut self, dimension: BudgetDimension, amount: f64) -> Reservation {
        if self.elapsed_seconds() >= self.profile.max_wall_time_seconds as f64 {
            debug!(%dimension, "reservation denied: wall time exhausted");
            return Reservation::Denied(BudgetDimension::WallTime);
        }

        match dimension {
            BudgetDimension::LlmCalls => {
                let requested = amount.ceil() as u32;
                if self.llm_calls_used + requested > self.profile.max_llm_calls {
                    debug!(
                        used = self.llm_calls_used,
                        limit = self.profile.max_llm_calls,
                        "reservation denied: llm calls exhausted"
                    );
                    return Reservation::Denied(BudgetDimension::LlmCalls);
                }
                self.llm_calls_used += requested;
            }
            BudgetDimension::ToolCalls => {
                let requested = amount.ceil() as u32;
                if self.tool_calls_used + requested > self.profile.max_tool_calls {
                    debug!(
                        used = self.tool_calls_used,
                        limit = self.profile.max_tool_calls,
                        "reservation denied: tool calls exhausted"
                    );
                    return Reservation::Denied(BudgetDimension::ToolCalls);
                }
                self.tool_calls_used += requested;
            }
            BudgetDimension::Cost => {
                if self.cost_usd_used + amount > self.profile.max_cost_usd {
                    debug!(
                        used = self.cost_usd_used,
                        limit = self.profile.max_cost_usd,
                        "reservation denied: cost exhausted"
                    );
                    return Reservation::Denied(BudgetDimension::Cost);
                }
                self.cost_usd_used += amount;
            }
            BudgetDimension::WallTime => {
                // elapsed already checked above; reserving wall time is the
                // check itself
            }
        }
        Reservation::Granted
    }

    /// Record spend measured after the fact (e.g. actual cost of a call).
    ///
    /// Recorded spend saturates the dimension; it cannot "un-deny" anything,
    /// and subsequent reservations see the updated counters.
    pub fn record(&mut self, dimension: BudgetDimension, amount: f64) {
        match dimension {
            BudgetDimension::LlmCalls => self.llm_calls_used += amount.ceil() as u32,
            BudgetDimension::ToolCalls => self.tool_calls_used += amount.ceil() as u32,
            BudgetDimension::Cost => self.cost_usd_used += amount,
            BudgetDimension::WallTime => {}
        }
    }

    /// Remaining headroom on a dimension, floored at zero.
    pub fn remaining(&self, dimension: BudgetDimension) -> f64 {
        match dimension {
            BudgetDimension::LlmCalls => {
                self.profile.max_llm_calls.saturating_sub(self.llm_calls_used) as f64
            }
            BudgetDimension::ToolCalls => {
                self.profile.max_tool_calls.saturating_sub(self.tool_calls_used) as f64
            }
            BudgetDimension::Cost => (self.profile.max_cost_usd - self.cost_usd_used).max(0.0),
            BudgetDimension::WallTime => {
                (self.profile.max_wall_time_seconds as f64 - self.elapsed_seconds()).max(0.0)
            }
        }
    }

    /// Remaining wall budget as a [`Duration`], for per-call timeboxes.
    ///
    /// Every network call must be bounded strictly below this so a single
    /// stalled call cannot silently consume the whole run.
    pub fn remaining_wall_time(&self) -> Duration {
        Duration::from_secs_f64(self.remaining(BudgetDimension::WallTime))
    }

    /// Counters snapshot for telemetry.
    pub fn state(&self) -> BudgetState {
        BudgetState {
            llm_calls_used: self.llm_calls_used,
            tool_calls_used: self.tool_calls_used,
            elapsed_seconds: self.elapsed_seconds(),
            cost_usd_used: self.cost_usd_used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(llm: u32, tools: u32, wall: u64, cost: f64) -> BudgetProfile {
        BudgetProfile {
            name: "test".into(),
            max_llm_calls: llm,
            max_tool_calls: tools,
            max_verify_candidates: 5,
            max_output_issues: 15,
            max_wall_time_seconds: wall,
            max_cost_usd: cost,
        }
    }

    #[test]
    fn llm_calls_deny_at_limit_never_beyond() {
        let mut tracker = BudgetTracker::new(profile(2, 3, 600, 1.0));
        assert!(tracker.reserve(BudgetDimension::LlmCalls, 1.0).is_granted());
        assert!(tracker.reserve(BudgetDimension::LlmCalls, 1.0).is_granted());
        assert_eq!(
            tracker.reserve(BudgetDimension::LlmCalls, 1.0),
            Reservation::Denied(BudgetDimension::LlmCalls)
        );
        // denial committed nothing
        assert_eq!(tracker.state().llm_calls_used, 2);
        assert_eq!(tracker.remaining(BudgetDimension::LlmCalls), 0.0);
    }

    #[test]
    fn tool_calls_track_independently() {
        let mut tracker = BudgetTracker::new(profile(2, 1, 600, 1.0));
        assert!(tracker.reserve(BudgetDimension::ToolCalls, 1.0).is_granted());
        assert_eq!(
            tracker.reserve(BudgetDimension::ToolCalls, 1.0),
            Reservation::Denied(BudgetDimension::ToolCalls)
        );
        // LLM budget untouched by tool denial
        assert!(tracker.reserve(BudgetDimension::LlmCalls, 1.0).is_granted());
    }

    #[test]
    fn cost_reservation_denies_over_ceiling() {
        let mut tracker = BudgetTracker::new(profile(5, 5, 600, 0.50));
        assert!(tracker.reserve(BudgetDimension::Cost, 0.30).is_granted());
        assert_eq!(
            tracker.reserve(BudgetDimension::Cost, 0.30),
            Reservation::Denied(BudgetDimension::Cost)
        );
        assert!(tracker.reserve(BudgetDimension::Cost, 0.20).is_granted());
        assert!(tracker.remaining(BudgetDimension::Cost).abs() < 1e-9);
    }

    #[test]
    fn exhausted_wall_time_denies_every_dimension() {
        let mut tracker = BudgetTracker::new(profile(5, 5, 0, 1.0));
        assert_eq!(
            tracker.reserve(BudgetDimension::LlmCalls, 1.0),
            Reservation::Denied(BudgetDimension::WallTime)
        );
        assert_eq!(
            tracker.reserve(BudgetDimension::ToolCalls, 1.0),
            Reservation::Denied(BudgetDimension::WallTime)
        );
        assert_eq!(
            tracker.reserve(BudgetDimension::Cost, 0.01),
            Reservation::Denied(BudgetDimension::WallTime)
        );
        assert_eq!(tracker.remaining(BudgetDimension::WallTime), 0.0);
        assert_eq!(tracker.remaining_wall_time(), Duration::ZERO);
    }

    #[test]
    fn record_saturates_dimension_for_later_reservations() {
        let mut tracker = BudgetTracker::new(profile(5, 5, 600, 0.10));
        // actual cost came in higher than reserved
        tracker.record(BudgetDimension::Cost, 0.09);
        assert_eq!(
            tracker.reserve(BudgetDimension::Cost, 0.05),
            Reservation::Denied(BudgetDimension::Cost)
        );
        assert!(tracker.reserve(BudgetDimension::Cost, 0.01).is_granted());
    }

    #[test]
    fn state_snapshot_reflects_counters() {
        let mut tracker = BudgetTracker::new(profile(5, 5, 600, 1.0));
        tracker.reserve(BudgetDimension::LlmCalls, 1.0);
        tracker.reserve(BudgetDimension::ToolCalls, 1.0);
        tracker.record(BudgetDimension::Cost, 0.25);
        let state = tracker.state();
        assert_eq!(state.llm_calls_used, 1);
        assert_eq!(state.tool_calls_used, 1);
        assert!((state.cost_usd_used - 0.25).abs() < 1e-9);
    }

    #[test]
    fn dimension_display_names() {
        assert_eq!(BudgetDimension::LlmCalls.to_string(), "llm_calls");
        assert_eq!(BudgetDimension::ToolCalls.to_string(), "tool_calls");
        assert_eq!(BudgetDimension::WallTime.to_string(), "wall_time");
        assert_eq!(BudgetDimension::Cost.to_string(), "cost_usd");
    }
}
