//! Error types for the address-space ledger

use crate::models::{StateKind, SubnetId};
use std::net::IpAddr;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`], used by callers to decide between
/// "fix the request", "pick another subnet" and "retry later".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Overlapping, non-nested or non-empty structural changes
    Structural,
    /// Request violates the subnet's allocation policy
    Policy,
    /// Subnet has no free address left
    Capacity,
    /// Address is in a state that does not permit the operation
    State,
    /// Referenced entity does not exist
    NotFound,
    /// Lock could not be acquired in time; safe to retry
    Busy,
    /// Configuration or persistence failure
    Environment,
    /// Bug or broken invariant
    Internal,
}

/// Ledger errors
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Structural errors
    #[error("Subnet not found: {0}")]
    SubnetNotFound(SubnetId),

    #[error("No subnet contains address {0}")]
    NoContainingSubnet(IpAddr),

    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Subnet {0} already exists")]
    SubnetExists(String),

    #[error("CIDR overlap detected: {cidr} overlaps with {existing}")]
    Overlap { cidr: String, existing: String },

    #[error("CIDR {cidr} is not nested inside {parent}")]
    NotNested { cidr: String, parent: String },

    #[error("Subnet {subnet} is not empty: {active} active allocations, {children} children")]
    NonEmpty {
        subnet: SubnetId,
        active: u128,
        children: usize,
    },

    #[error("Change to subnet {subnet} would strand allocation {address} on an unusable address")]
    WouldStrand { subnet: SubnetId, address: IpAddr },

    // Policy violations
    #[error("Address {address} is outside the allocatable range of subnet {subnet}")]
    AddressOutOfRange { address: IpAddr, subnet: SubnetId },

    #[error("Subnet {0} requires a hostname for every allocation")]
    HostnameRequired(SubnetId),

    #[error("Address {0} is the reserved gateway")]
    GatewayConflict(IpAddr),

    #[error("Invalid allocation policy: {0}")]
    InvalidPolicy(String),

    // Capacity
    #[error("No free addresses in subnet {0}")]
    NoCapacity(SubnetId),

    // Address state
    #[error("Address {0} is already allocated")]
    AlreadyAllocated(IpAddr),

    #[error("Address {0} is not allocated")]
    NotAllocated(IpAddr),

    #[error("Invalid transition for {address}: {event} is not allowed from {from}")]
    InvalidTransition {
        address: IpAddr,
        from: StateKind,
        event: &'static str,
    },

    // Conflicts
    #[error("Conflict not found: {0}")]
    ConflictNotFound(Uuid),

    #[error("Conflict {0} is already resolved")]
    ConflictAlreadyResolved(Uuid),

    // Concurrency
    #[error("Resource busy: {0}")]
    Busy(String),

    // Environment
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // General errors
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::InvalidCidr(_)
            | Error::SubnetExists(_)
            | Error::Overlap { .. }
            | Error::NotNested { .. }
            | Error::NonEmpty { .. }
            | Error::WouldStrand { .. } => ErrorClass::Structural,

            Error::AddressOutOfRange { .. }
            | Error::HostnameRequired(_)
            | Error::GatewayConflict(_)
            | Error::InvalidPolicy(_)
            | Error::InvalidArgument(_) => ErrorClass::Policy,

            Error::NoCapacity(_) => ErrorClass::Capacity,

            Error::AlreadyAllocated(_)
            | Error::NotAllocated(_)
            | Error::InvalidTransition { .. }
            | Error::ConflictAlreadyResolved(_) => ErrorClass::State,

            Error::SubnetNotFound(_) | Error::NoContainingSubnet(_) | Error::ConflictNotFound(_) => {
                ErrorClass::NotFound
            }

            Error::Busy(_) => ErrorClass::Busy,

            Error::Config(_) | Error::Storage(_) => ErrorClass::Environment,

            Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Busy
    }
}

impl From<ipnet::PrefixLenError> for Error {
    fn from(e: ipnet::PrefixLenError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for Error {
    fn from(e: ipnet::AddrParseError) -> Self {
        Error::InvalidCidr(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
