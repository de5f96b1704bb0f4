//! Data models for the address-space ledger

mod allocation;
mod audit;
mod conflict;
mod observation;
mod subnet;

pub use allocation::{
    AddressStatus, AllocationRecord, AllocationSource, AllocationState, AllocationType,
    ExpiryReason, HostIdentity, ResolveTarget, StateKind, Transition,
};
pub use audit::AuditEntry;
pub use conflict::{
    AutoAction, ConflictFilter, ConflictKind, ConflictRecord, ConflictStatus, ResolutionAction,
};
pub use observation::{ObservationMethod, ObservedHostFact};
pub use subnet::{AllocationPolicy, Subnet, SubnetId, SubnetSpec};

use chrono::Duration;

/// Largest whole-second span chrono represents
const MAX_SPAN_SECS: i64 = i64::MAX / 1_000;

/// Seconds as a duration, saturating at [`MAX_SPAN_SECS`]
///
/// Deadlines built from a saturated span overflow `DateTime` and are
/// treated as never reached.
pub(crate) fn saturating_seconds(secs: u64) -> Duration {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(MAX_SPAN_SECS);
    Duration::try_seconds(secs).unwrap_or_else(Duration::zero)
}
