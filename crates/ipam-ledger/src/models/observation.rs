//! Observed host facts fed in by discovery, DHCP and DNS collaborators

use super::{AllocationSource, HostIdentity};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How a host was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationMethod {
    Ping,
    Arp,
    Snmp,
    PortScan,
    Dhcp,
    Dns,
    Other,
}

impl ObservationMethod {
    /// Record source used when an observation is adopted into the ledger
    pub fn source(&self) -> AllocationSource {
        match self {
            ObservationMethod::Dhcp => AllocationSource::Dhcp,
            ObservationMethod::Dns => AllocationSource::Dns,
            _ => AllocationSource::Discovery,
        }
    }
}

/// A single observation of an address in use
///
/// All collaborators deliver this one shape; nothing downstream branches on
/// the integration that produced it beyond [`ObservationMethod::source`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedHostFact {
    pub address: IpAddr,
    #[serde(flatten)]
    pub identity: HostIdentity,
    pub method: ObservationMethod,
    pub observed_at: DateTime<Utc>,
    /// How long the observation stays meaningful, in seconds
    pub ttl_secs: Option<u64>,
}

impl ObservedHostFact {
    pub fn new(address: IpAddr, method: ObservationMethod) -> Self {
        Self {
            address,
            identity: HostIdentity::default(),
            method,
            observed_at: Utc::now(),
            ttl_secs: None,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.identity = HostIdentity::new(Some(hostname.into()), self.identity.mac.take());
        self
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.identity = HostIdentity::new(self.identity.hostname.take(), Some(mac.into()));
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.num_seconds().max(0) as u64);
        self
    }

    /// Whether the observation has outlived its TTL at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl_secs {
            Some(ttl) => self
                .observed_at
                .checked_add_signed(super::saturating_seconds(ttl))
                .map(|deadline| deadline < now)
                .unwrap_or(false),
            None => false,
        }
    }
}
