//! ordm-stuck
//!
//! Stuck-transaction detection and resolution planning.
//!
//! - A broadcast leg unconfirmed past the staleness threshold is flagged.
//! - A leg the chain already confirmed is healed instead of flagged, even
//!   when the record was flagged on an earlier sweep.
//! - Resolution actions are planned here and committed by the store; fee
//!   bumps are recorded as intent only.
//!
//! Deterministic, pure logic. No IO. No oracle calls.

mod detector;
mod resolution;
mod types;

pub use detector::{decide, in_flight_leg, is_sweep_candidate, stale_cutoff, sweep_order_key};
pub use resolution::{plan_resolution, Resolution, ResolutionAction, ResolutionError};
pub use types::*;
