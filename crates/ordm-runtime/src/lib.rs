//! ordm-runtime
//!
//! [`MintEngine`] wires the pure crates (eligibility, settlement, stuck) to a
//! [`ordm_db::LedgerStore`] and a [`ordm_oracle::ConfirmationOracle`] and
//! exposes the engine's inbound calls: claim, cancel-claim, complete-claim,
//! begin-settlement, record-event, run-stuck-sweep, resolve-stuck.
//!
//! Every decision takes "now" from the injected [`Clock`].

mod clock;
mod engine;
mod error;
mod sweep;

pub use clock::{Clock, SystemClock};
pub use engine::{ClaimRequest, EventOutcome, Limits, MintEngine};
pub use error::EngineError;
pub use sweep::StuckResolution;
