//! # tonmine-rate: Tiered yield rate engine and accrual clock.
//!
//! All calculations use integer arithmetic only for determinism.
//!
//! - **Rate engine**: principal tier, duration bonus, rank multiplier, speed
//!   boost on the reward, and absolute caps.
//! - **Accrual clock**: linear interpolation of the displayed balance between
//!   authoritative checkpoints.

pub mod clock;
pub mod engine;

pub use clock::{current_estimate, AccrualClock};
pub use engine::RateEngine;
