//! Ledger configuration
//!
//! Loaded from TOML. Everything has a default except the reconciliation
//! grace period, which must be chosen explicitly:
//!
//! ```toml
//! lock_timeout_ms = 250
//! exhaustion_thresholds = [75, 90]
//! event_channel_capacity = 1024
//! sweep_interval_secs = 60
//!
//! [reconcile]
//! stale_grace_secs = 86400
//! discard_expired_facts = true
//! ```

use crate::allocator::DEFAULT_THRESHOLDS;
use crate::reconcile::ReconcilerConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Reconciliation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Seconds a recorded address may go unobserved before it is reclaimed
    pub stale_grace_secs: u64,
    #[serde(default = "default_true")]
    pub discard_expired_facts: bool,
}

/// Top-level ledger configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Upper bound on every lock wait before `Busy` is returned
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Utilization percentages that raise capacity events
    #[serde(default = "default_thresholds")]
    pub exhaustion_thresholds: Vec<u8>,
    /// Per-channel broadcast buffer; 0 keeps the per-channel defaults
    #[serde(default)]
    pub event_channel_capacity: usize,
    /// Period of the background lease sweeper
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub reconcile: ReconcileSettings,
}

fn default_true() -> bool {
    true
}

fn default_lock_timeout_ms() -> u64 {
    250
}

fn default_thresholds() -> Vec<u8> {
    DEFAULT_THRESHOLDS.to_vec()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl LedgerConfig {
    /// Defaults plus the required grace period
    pub fn new(stale_grace: Duration) -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            exhaustion_thresholds: default_thresholds(),
            event_channel_capacity: 0,
            sweep_interval_secs: default_sweep_interval_secs(),
            reconcile: ReconcileSettings {
                stale_grace_secs: stale_grace.as_secs(),
                discard_expired_facts: true,
            },
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: LedgerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&raw)?;
        tracing::info!(path = %path.display(), "Loaded ledger configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be positive".into()));
        }
        if self.sweep_interval_secs == 0 {
            return Err(Error::Config("sweep_interval_secs must be positive".into()));
        }
        if let Some(bad) = self.exhaustion_thresholds.iter().find(|t| **t == 0 || **t > 100) {
            return Err(Error::Config(format!(
                "exhaustion threshold {} outside 1..=100",
                bad
            )));
        }
        if self.reconcile.stale_grace_secs == 0 {
            return Err(Error::Config("reconcile.stale_grace_secs must be positive".into()));
        }
        if i64::try_from(self.reconcile.stale_grace_secs).is_err() {
            return Err(Error::Config("reconcile.stale_grace_secs is too large".into()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        let grace = crate::models::saturating_seconds(self.reconcile.stale_grace_secs);
        let config = ReconcilerConfig::new(grace);
        if self.reconcile.discard_expired_facts {
            config
        } else {
            config.keep_expired_facts()
        }
    }
}
