//! # tonmine-node: Reconciliation, batch distribution and orchestration.
//!
//! Composes the tonmine subsystems into a running engine:
//! - [`store::MemoryStore`]: in-process authoritative store
//! - [`reconcile::ReconciliationService`]: replays the offline ledger
//! - [`distributor::BatchDistributor`]: periodic settlement job
//! - [`activity::ActivityRecorder`]: user-visible event feed
//! - [`sync::SyncWorker`] / [`ticker::DisplayTicker`]: background loops
//! - [`node::Node`]: composition root
//! - [`config::NodeConfig`]: node configuration

pub mod activity;
pub mod cancel;
pub mod config;
pub mod distributor;
pub mod node;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod sync;
pub mod ticker;

pub use activity::ActivityRecorder;
pub use cancel::Cancellation;
pub use config::NodeConfig;
pub use distributor::{BatchDistributor, DistributorConfig, RunReport};
pub use node::Node;
pub use reconcile::{OfflineReceipt, ReconciliationService};
pub use retry::RetryPolicy;
pub use store::MemoryStore;
pub use sync::{DrainReport, SyncWorker};
pub use ticker::DisplayTicker;
