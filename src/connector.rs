//! Platform connector contract and registry.
//!
//! A [`Connector`] adapts one external platform (a source-control host, a
//! chat workspace) to the ingestion pipeline. The orchestrator never talks
//! to a platform directly; it looks the connector up by platform name in a
//! [`ConnectorRegistry`] and drives it through one sync cycle at a time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐  │
//! │  │ export:  │ │ export:  │ │  Custom  │  │
//! │  │ github   │ │ slack    │ │  (Rust)  │  │
//! │  └──────────┘ └──────────┘ └──────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!    IngestionOrchestrator::run_ingestion_cycle()
//! ```
//!
//! # Usage
//!
//! ```rust
//! use context_ingest::connector::ConnectorRegistry;
//!
//! let connectors = ConnectorRegistry::new();
//! // connectors.register(Arc::new(MyConnector::new()))?;
//! assert!(connectors.is_empty());
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use context_ingest_core::models::{Metadata, NormalizedEvent, RawEvent};
use context_ingest_core::store::ProjectIntegration;

use crate::config::Config;

/// Static description of the platform a connector serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformInfo {
    /// Registry key, e.g. `"github"`. Matches `ProjectIntegration::platform`.
    pub name: String,
    pub display_name: String,
    pub version: String,
}

/// Outcome of [`Connector::authenticate`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    pub authenticated: bool,
    /// Account or workspace the credentials resolved to.
    pub account: Option<String>,
    pub message: Option<String>,
}

impl AuthResult {
    pub fn granted(account: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account: Some(account.into()),
            message: None,
        }
    }

    pub fn denied(message: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account: None,
            message: Some(message.into()),
        }
    }
}

/// A platform adapter that produces events for ingestion.
///
/// # Lifecycle
///
/// 1. The connector is registered via [`ConnectorRegistry::register`].
/// 2. [`authenticate`](Connector::authenticate) runs when ingestion starts
///    for an integration on this platform.
/// 3. Each cycle calls [`fetch_events`](Connector::fetch_events), then
///    [`normalize`](Connector::normalize) on the events that survived
///    deduplication.
/// 4. [`schedule_sync`](Connector::schedule_sync) picks the delay before
///    the next cycle.
///
/// Delivery is at least once: `fetch_events` may return events already
/// seen in an earlier cycle. The orchestrator deduplicates by
/// `RawEvent::platform_id`.
#[async_trait]
pub trait Connector: Send + Sync {
    fn describe(&self) -> PlatformInfo;

    /// Validate the integration's connector settings and credentials.
    async fn authenticate(&self, config: &Metadata) -> Result<AuthResult>;

    /// Fetch up to `limit` events that occurred after `since`, oldest first.
    async fn fetch_events(
        &self,
        integration: &ProjectIntegration,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawEvent>>;

    /// Convert raw platform records into [`NormalizedEvent`]s.
    ///
    /// Records that cannot be represented are dropped, not errors.
    async fn normalize(&self, events: Vec<RawEvent>) -> Result<Vec<NormalizedEvent>>;

    /// Recommended delay before the next sync, given the previous one.
    fn schedule_sync(&self, last_sync: Option<DateTime<Utc>>) -> Duration;
}

/// Registry of connectors keyed by platform name.
///
/// Use [`ConnectorRegistry::from_config`] to create a registry pre-loaded
/// with the export-replay connectors from the config file, then optionally
/// call [`register`](ConnectorRegistry::register) to add custom ones.
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    /// Create an empty connector registry.
    pub fn new() -> Self {
        Self {
            connectors: BTreeMap::new(),
        }
    }

    /// Create a registry with one export-replay connector per
    /// `[connectors.export.<platform>]` table.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::connector_export::ExportConnector;

        let mut registry = Self::new();
        for (platform, cfg) in &config.connectors.export {
            let connector = ExportConnector::new(platform.clone(), cfg.clone())?;
            registry.register(Arc::new(connector))?;
        }
        Ok(registry)
    }

    /// Register a connector under its platform name.
    ///
    /// Fails when a connector for the same platform is already registered.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Result<()> {
        let name = connector.describe().name;
        if self.connectors.contains_key(&name) {
            bail!("A connector for platform '{}' is already registered", name);
        }
        self.connectors.insert(name, connector);
        Ok(())
    }

    /// Find the connector for a platform.
    pub fn get(&self, platform: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(platform).cloned()
    }

    /// Registered platform names, sorted.
    pub fn platforms(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    /// Platform descriptions, sorted by name.
    pub fn describe_all(&self) -> Vec<PlatformInfo> {
        self.connectors.values().map(|c| c.describe()).collect()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Return the count of registered connectors.
    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
