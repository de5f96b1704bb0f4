use crate::ledger::RecordChange;
use crate::models::{AllocationSource, AllocationType, HostIdentity, SubnetId};
use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;

/// Request to allocate or reserve an address
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    /// Subnet to allocate from
    pub subnet_id: SubnetId,
    /// Specific address (lowest free address if None)
    pub address: Option<IpAddr>,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub device_type: Option<String>,
    pub owner: Option<String>,
    pub description: Option<String>,
    pub allocation_type: AllocationType,
    pub source: AllocationSource,
    /// Lease override (subnet default if None)
    pub lease: Option<Duration>,
    /// Recorded in the audit trail
    pub actor: String,
}

impl AllocationRequest {
    pub fn new(subnet_id: SubnetId) -> Self {
        Self {
            subnet_id,
            address: None,
            hostname: None,
            mac: None,
            device_type: None,
            owner: None,
            description: None,
            allocation_type: AllocationType::default(),
            source: AllocationSource::Manual,
            lease: None,
            actor: "system".to_string(),
        }
    }

    pub fn with_address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    pub fn with_device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn static_allocation(mut self) -> Self {
        self.allocation_type = AllocationType::Static;
        self
    }

    pub fn with_source(mut self, source: AllocationSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub(crate) fn has_hostname(&self) -> bool {
        self.hostname
            .as_deref()
            .map(|h| !h.trim().is_empty())
            .unwrap_or(false)
    }

    /// Record fields for the new record
    ///
    /// Static allocations only expire when given an explicit lease. A lease
    /// reaching past the representable range never expires.
    pub(crate) fn change(&self, now: DateTime<Utc>, default_lease: Option<Duration>) -> RecordChange {
        let lease = match self.allocation_type {
            AllocationType::Static => self.lease,
            AllocationType::Dynamic => self.lease.or(default_lease),
        };
        RecordChange::new()
            .identity(HostIdentity::new(self.hostname.clone(), self.mac.clone()))
            .device_type(self.device_type.clone())
            .owner(self.owner.clone())
            .description(self.description.clone())
            .allocation_type(self.allocation_type)
            .source(self.source)
            .expires_at(lease.and_then(|l| now.checked_add_signed(l)))
    }
}
