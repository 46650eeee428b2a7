//! State Management Module
//!
//! Replica-local persistent state.

mod ledger;

pub use ledger::AppliedLedger;
