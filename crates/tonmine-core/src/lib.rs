//! # tonmine-core
//! Foundation types, configuration and traits for the tonmine accrual engine.

pub mod config;
pub mod constants;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;
