//! Capacity planning over the address space
//!
//! Utilization is always computed against allocatable addresses: the policy
//! window minus child ranges and the reserved gateway. Forecasts are a plain
//! linear projection of free capacity against a supplied growth trend.

use crate::ledger::AllocationLedger;
use crate::models::{StateKind, SubnetId};
use crate::space::AddressSpace;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Utilization at or above this percentage is a warning
pub const WARNING_PERCENT: f64 = 75.0;
/// Utilization at or above this percentage is critical
pub const CRITICAL_PERCENT: f64 = 90.0;

/// Coarse utilization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtilizationBand {
    Normal,
    Warning,
    Critical,
}

impl UtilizationBand {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= CRITICAL_PERCENT {
            UtilizationBand::Critical
        } else if percent >= WARNING_PERCENT {
            UtilizationBand::Warning
        } else {
            UtilizationBand::Normal
        }
    }
}

/// Utilization of one subnet, taken at a single instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub subnet_id: SubnetId,
    /// Allocatable addresses
    pub total: u128,
    /// ALLOCATED or CONFLICTED
    pub used: u128,
    /// RESERVED, not yet confirmed
    pub reserved_pending: u128,
    pub free: u128,
    /// Share of `total` not free
    pub percent: f64,
    pub band: UtilizationBand,
}

/// Observed growth rate of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthTrend {
    pub addresses_per_day: f64,
}

impl GrowthTrend {
    pub fn per_day(addresses_per_day: f64) -> Self {
        Self { addresses_per_day }
    }
}

/// Result of an exhaustion forecast
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Forecast {
    /// Projected to run out of free addresses at `at`
    Exhaustion { at: DateTime<Utc> },
    /// No exhaustion inside the horizon, or no usable trend
    Unknown,
}

/// Totals across every subnet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceSummary {
    pub total_subnets: usize,
    pub total_addresses: u128,
    pub allocated: u128,
    pub available: u128,
    /// Mean of per-subnet utilization percentages
    pub average_utilization: f64,
}

/// Read-only capacity queries
#[derive(Debug, Clone)]
pub struct CapacityPlanner {
    space: Arc<AddressSpace>,
    ledger: Arc<AllocationLedger>,
}

impl CapacityPlanner {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        let ledger = space.ledger().clone();
        Self { space, ledger }
    }

    /// Utilization of a subnet
    pub fn utilization(&self, subnet_id: SubnetId) -> Result<Utilization> {
        self.space.with_subnet(subnet_id, |view| {
            let mut used = 0u128;
            let mut reserved_pending = 0u128;
            for record in self.ledger.records_in(view.id())? {
                if !view.is_allocatable(record.address) {
                    continue;
                }
                match record.kind() {
                    StateKind::Allocated | StateKind::Conflicted => used += 1,
                    StateKind::Reserved => reserved_pending += 1,
                    _ => {}
                }
            }

            let total = view.allocatable_count();
            let free = self.space.free_in_view(view);
            let percent = if total == 0 {
                100.0
            } else {
                total.saturating_sub(free) as f64 / total as f64 * 100.0
            };

            Ok(Utilization {
                subnet_id,
                total,
                used,
                reserved_pending,
                free,
                percent,
                band: UtilizationBand::from_percent(percent),
            })
        })
    }

    /// Project when the subnet runs out of free addresses
    pub fn forecast(
        &self,
        subnet_id: SubnetId,
        horizon: Duration,
        trend: Option<GrowthTrend>,
    ) -> Result<Forecast> {
        self.forecast_at(subnet_id, horizon, trend, Utc::now())
    }

    /// Forecast as of `now`
    ///
    /// A full subnet is exhausted at `now`. Without a positive trend, or when
    /// the projection falls past `now + horizon`, the answer is
    /// [`Forecast::Unknown`].
    pub fn forecast_at(
        &self,
        subnet_id: SubnetId,
        horizon: Duration,
        trend: Option<GrowthTrend>,
        now: DateTime<Utc>,
    ) -> Result<Forecast> {
        let free = self.space.free_capacity(subnet_id)?;
        if free == 0 {
            return Ok(Forecast::Exhaustion { at: now });
        }

        let Some(rate) = trend
            .map(|t| t.addresses_per_day)
            .filter(|r| r.is_finite() && *r > 0.0)
        else {
            return Ok(Forecast::Unknown);
        };

        let days = free as f64 / rate;
        let horizon_days = horizon.num_seconds() as f64 / 86_400.0;
        if days > horizon_days {
            return Ok(Forecast::Unknown);
        }

        // Past the representable range the date is as good as unknown
        let Some(at) = Duration::try_seconds((days * 86_400.0).ceil() as i64)
            .and_then(|span| now.checked_add_signed(span))
        else {
            return Ok(Forecast::Unknown);
        };
        tracing::debug!(subnet_id = %subnet_id, free, days, "Exhaustion projected");
        Ok(Forecast::Exhaustion { at })
    }

    /// Totals across the whole space
    pub fn summary(&self) -> Result<SpaceSummary> {
        let subnets = self.space.list()?;
        let mut total_addresses = 0u128;
        let mut allocated = 0u128;
        let mut available = 0u128;
        let mut percent_sum = 0.0;

        for subnet in &subnets {
            let utilization = self.utilization(subnet.id)?;
            total_addresses += utilization.total;
            allocated += utilization.used + utilization.reserved_pending;
            available += utilization.free;
            percent_sum += utilization.percent;
        }

        let average_utilization = if subnets.is_empty() {
            0.0
        } else {
            percent_sum / subnets.len() as f64
        };

        Ok(SpaceSummary {
            total_subnets: subnets.len(),
            total_addresses,
            allocated,
            available,
            average_utilization,
        })
    }
}
