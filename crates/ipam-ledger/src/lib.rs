//! IPAM Address-Space Ledger
//!
//! Authoritative in-memory ledger of IPv4/IPv6 address space:
//! - Hierarchical subnet tree with non-overlap guarantees
//! - Per-address allocation state machine with an append-only audit trail
//! - Deterministic lowest-first allocation under per-subnet policy
//! - Reconciliation of observed hosts into conflict records
//! - Utilization, threshold events and exhaustion forecasts
//!
//! Features:
//! - No global lock: per-address slot locks and per-subnet gates
//! - Bounded lock waits surfacing a retryable `Busy` error
//! - Broadcast events for allocation, conflict, capacity and topology changes
//! - Snapshot export and restore (in memory or JSON file)

pub mod address;
pub mod allocator;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod planner;
pub mod reconcile;
pub mod service;
pub mod space;
pub mod storage;

// Re-export core types
pub use allocator::{AllocationEngine, AllocationRequest};
pub use config::LedgerConfig;
pub use error::{Error, ErrorClass, Result};
pub use events::{Channel, EventPublisher, LedgerMessage};
pub use ledger::AllocationLedger;
pub use models::{
    AddressStatus, AllocationPolicy, AllocationRecord, AllocationState, AuditEntry,
    ConflictFilter, ConflictKind, ConflictRecord, ConflictStatus, ObservationMethod,
    ObservedHostFact, ResolutionAction, StateKind, Subnet, SubnetId, SubnetSpec,
};
pub use planner::{CapacityPlanner, Forecast, GrowthTrend, Utilization, UtilizationBand};
pub use reconcile::{ReconcilerConfig, ReconciliationEngine};
pub use service::{AddressReport, IpamService};
pub use space::AddressSpace;
pub use storage::{JsonFileStore, LedgerSnapshot, MemoryStore, SnapshotStore};
