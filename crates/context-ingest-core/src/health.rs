//! Integration health classification.
//!
//! Health is derived, never stored: each integration's state comes from its
//! stored `status` and `last_sync_status`, and the project-level
//! [`OverallStatus`] comes from the mix of healthy and failed integrations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stored lifecycle status of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Active,
    Inactive,
    Error,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Active => "active",
            IntegrationStatus::Inactive => "inactive",
            IntegrationStatus::Error => "error",
        }
    }
}

impl fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(IntegrationStatus::Active),
            "inactive" => Ok(IntegrationStatus::Inactive),
            "error" => Ok(IntegrationStatus::Error),
            other => anyhow::bail!("Unknown integration status: '{}'", other),
        }
    }
}

/// Outcome of the most recent sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(SyncStatus::Success),
            "error" => Ok(SyncStatus::Error),
            other => anyhow::bail!("Unknown sync status: '{}'", other),
        }
    }
}

/// Derived per-integration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    Healthy,
    Failed,
    Inactive,
}

/// Project-level health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Down,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Degraded => "degraded",
            OverallStatus::Down => "down",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An integration is failed when its status is `error` or its last sync
/// errored; inactive integrations are neither healthy nor failed.
pub fn derive_state(
    status: IntegrationStatus,
    last_sync_status: Option<SyncStatus>,
) -> IntegrationState {
    match (status, last_sync_status) {
        (IntegrationStatus::Error, _) => IntegrationState::Failed,
        (IntegrationStatus::Active, Some(SyncStatus::Error)) => IntegrationState::Failed,
        (IntegrationStatus::Inactive, _) => IntegrationState::Inactive,
        (IntegrationStatus::Active, _) => IntegrationState::Healthy,
    }
}

/// Aggregate counts over a project's integrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCounts {
    pub total: usize,
    /// Integrations whose stored status is `active`, failed or not.
    pub active: usize,
    pub failed: usize,
    pub healthy: usize,
}

impl HealthCounts {
    pub fn tally<I>(integrations: I) -> Self
    where
        I: IntoIterator<Item = (IntegrationStatus, Option<SyncStatus>)>,
    {
        let mut counts = HealthCounts::default();
        for (status, last_sync) in integrations {
            counts.total += 1;
            if status == IntegrationStatus::Active {
                counts.active += 1;
            }
            match derive_state(status, last_sync) {
                IntegrationState::Healthy => counts.healthy += 1,
                IntegrationState::Failed => counts.failed += 1,
                IntegrationState::Inactive => {}
            }
        }
        counts
    }

    /// `down` when every integration failed, `degraded` when some but not
    /// all did (an inactive integration is not a failed one), `healthy`
    /// otherwise, including a project with no integrations.
    pub fn overall(&self) -> OverallStatus {
        match self.failed {
            0 => OverallStatus::Healthy,
            n if n == self.total => OverallStatus::Down,
            _ => OverallStatus::Degraded,
        }
    }
}
