//! Address allocation with policy enforcement
//!
//! Provides:
//! - Lowest-first selection of free addresses inside a subnet's policy window
//! - Allocate, reserve, confirm, release and renew on top of the ledger
//! - Lease expiry sweeping

mod engine;
mod request;
mod selector;

pub use engine::{AllocationEngine, DEFAULT_THRESHOLDS};
pub use request::AllocationRequest;
