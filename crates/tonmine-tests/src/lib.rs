//! End-to-end and adversarial test suite for the tonmine accrual engine.
//!
//! The tests drive a full [`Node`](tonmine_node_lib::Node) on a manual
//! clock and attack the reconciliation and distribution paths with lost
//! responses, transient failures, concurrent writers and cancellation.

pub mod helpers;
