//! Ledger events for notification and reporting collaborators
//!
//! # Channel Descriptions
//!
//! | Channel | Purpose |
//! |---------|---------|
//! | `ipam.allocations` | Address allocated, released, expired |
//! | `ipam.conflicts` | Conflict detected, resolved |
//! | `ipam.capacity` | Utilization threshold crossings |
//! | `ipam.topology` | Subnet created, removed |
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut rx = service.subscribe(Channel::Conflicts);
//! while let Ok(msg) = rx.recv().await {
//!     println!("Event: {}", msg.description());
//! }
//! ```

pub mod channels;
pub mod messages;
pub mod publisher;

pub use channels::Channel;
pub use messages::{
    AddressEvent, AddressExpiredEvent, CapacityThresholdEvent, ConflictDetectedEvent,
    ConflictResolvedEvent, LedgerMessage, SubnetEvent,
};
pub use publisher::{EventPublisher, PublisherStats};
