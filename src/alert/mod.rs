//! Alerting rules evaluated once per tick.
//!
//! Each detector reads the current tank level (and the rolling history
//! where it needs a window), updates its own idempotency marker in the
//! persisted state, and returns the events that should be dispatched.
//! Detectors never perform I/O and never fail.
//!
//! Submodules:
//! - `thresholds`: hysteresis-protected level crossings.
//! - `recovery`: stagnation followed by well recovery.
//! - `backflush`: overnight sudden drops from the filter backflush cycle.
//! - `high_flow`: sustained fill rate above a configured GPH.
//! - `sensors`: pressure switch and float state changes.
//! - `stalenesses`: rejects tank readings older than the freshness limit.

pub mod backflush;
pub mod high_flow;
pub mod recovery;
pub mod sensors;
pub mod stalenesses;
pub mod thresholds;
