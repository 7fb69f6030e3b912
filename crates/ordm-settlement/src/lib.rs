//! ordm-settlement
//!
//! Pure commit/reveal settlement state machine. No I/O, no wall clock: the
//! caller supplies `now` and commits the returned [`SettlementEffects`] in the
//! same store transaction that persists the record.

pub mod state_machine;

pub use state_machine::{
    apply, inscription_id_for_reveal, MintEvent, SettlementEffects, Transition, TransitionError,
    ABANDONED_CODE, ABANDONED_REASON,
};
