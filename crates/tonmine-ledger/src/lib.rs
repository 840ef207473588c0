//! # tonmine-ledger: Durable offline ledger.
//!
//! Records balance actions taken while the authoritative store is
//! unreachable, as ordered deltas to be replayed by reconciliation.

pub mod ledger;

pub use ledger::DurableLedger;
