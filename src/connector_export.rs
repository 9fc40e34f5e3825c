//! Export-replay connector.
//!
//! Reads platform event dumps written as JSON Lines (`*.jsonl`, `*.ndjson`)
//! from a directory tree. Each line is one platform record:
//!
//! ```json
//! {"id": "pr-42", "type": "pull_request", "timestamp": "2024-05-01T10:00:00Z",
//!  "author": "alice", "title": "Switch to sqlx", "body": "We decided to ...",
//!  "files": ["src/db.rs"], "labels": ["storage"], "thread": "pr-42"}
//! ```
//!
//! Keys other than the well-known ones are carried into the event metadata.
//! Lines that are not JSON objects with an `id` and a `timestamp` are
//! skipped with a warning.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use context_ingest_core::models::{
    EventType, Metadata, MetadataValue, NormalizedEvent, RawEvent,
};
use context_ingest_core::store::ProjectIntegration;

use crate::config::ExportConnectorConfig;
use crate::connector::{AuthResult, Connector, PlatformInfo};

const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Keys consumed by normalization; everything else becomes metadata.
const KNOWN_KEYS: [&str; 15] = [
    "id",
    "type",
    "timestamp",
    "author",
    "user",
    "title",
    "body",
    "text",
    "files",
    "labels",
    "features",
    "thread",
    "thread_id",
    "thread_ts",
    "platform",
];

pub struct ExportConnector {
    platform: String,
    config: ExportConnectorConfig,
    include_set: GlobSet,
}

impl ExportConnector {
    pub fn new(platform: String, config: ExportConnectorConfig) -> Result<Self> {
        let include_set = build_globset(&config.include_globs)?;
        Ok(Self {
            platform,
            config,
            include_set,
        })
    }

    /// The integration's `root` setting wins over the configured root.
    fn root_for(&self, settings: &Metadata) -> PathBuf {
        settings
            .get("root")
            .and_then(MetadataValue::as_str)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.root.clone())
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(
            self.config
                .sync_interval_secs
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        )
    }
}

#[async_trait]
impl Connector for ExportConnector {
    fn describe(&self) -> PlatformInfo {
        PlatformInfo {
            name: self.platform.clone(),
            display_name: self
                .config
                .display_name
                .clone()
                .unwrap_or_else(|| format!("{} (export)", self.platform)),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    async fn authenticate(&self, config: &Metadata) -> Result<AuthResult> {
        let root = self.root_for(config);
        if root.is_dir() {
            Ok(AuthResult::granted(root.display().to_string()))
        } else {
            Ok(AuthResult::denied(format!(
                "Export root does not exist: {}",
                root.display()
            )))
        }
    }

    async fn fetch_events(
        &self,
        integration: &ProjectIntegration,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<RawEvent>> {
        let root = self.root_for(&integration.config);
        let include_set = self.include_set.clone();
        let platform = self.platform.clone();

        let mut events = tokio::task::spawn_blocking(move || {
            scan_exports(&root, &include_set, &platform)
        })
        .await
        .map_err(|e| anyhow!("Export scan task failed: {}", e))??;

        if let Some(since) = since {
            events.retain(|e| e.occurred_at > since);
        }
        events.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.platform_id.cmp(&b.platform_id))
        });
        events.truncate(limit);
        Ok(events)
    }

    async fn normalize(&self, events: Vec<RawEvent>) -> Result<Vec<NormalizedEvent>> {
        Ok(events
            .into_iter()
            .filter_map(|raw| {
                let id = raw.platform_id.clone();
                let normalized = normalize_record(raw);
                if normalized.is_none() {
                    tracing::warn!(platform = %self.platform, event_id = %id, "dropping non-object export record");
                }
                normalized
            })
            .collect())
    }

    fn schedule_sync(&self, last_sync: Option<DateTime<Utc>>) -> Duration {
        let base = self.interval();
        let catch_up = base / 4;
        match last_sync {
            None => catch_up,
            Some(last) => {
                let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
                if elapsed > base * 2 {
                    catch_up
                } else {
                    base
                }
            }
        }
    }
}

fn scan_exports(root: &Path, include_set: &GlobSet, platform: &str) -> Result<Vec<RawEvent>> {
    if !root.is_dir() {
        bail!("Export root does not exist: {}", root.display());
    }

    let mut events = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();
        if !include_set.is_match(&rel_str) {
            continue;
        }

        read_export_file(path, platform, &mut events)?;
    }
    Ok(events)
}

fn read_export_file(path: &Path, platform: &str, out: &mut Vec<RawEvent>) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open export file: {}", path.display()))?;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(&line, platform) {
            Ok(event) => out.push(event),
            Err(e) => tracing::warn!(
                file = %path.display(),
                line = idx + 1,
                error = %e,
                "skipping unparseable export record"
            ),
        }
    }
    Ok(())
}

fn parse_record(line: &str, platform: &str) -> Result<RawEvent> {
    let payload: Value = serde_json::from_str(line)?;
    let obj = payload
        .as_object()
        .ok_or_else(|| anyhow!("record is not a JSON object"))?;

    let platform_id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => bail!("record has no id"),
    };
    let occurred_at = obj
        .get("timestamp")
        .and_then(parse_timestamp)
        .ok_or_else(|| anyhow!("record {} has no valid timestamp", platform_id))?;

    Ok(RawEvent {
        platform_id,
        platform: platform.to_string(),
        occurred_at,
        payload,
    })
}

/// RFC 3339 strings, or Unix seconds (milliseconds above 10^12).
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw.abs() >= 1_000_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

fn normalize_record(raw: RawEvent) -> Option<NormalizedEvent> {
    let Value::Object(obj) = raw.payload else {
        return None;
    };

    let event_type = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(|t| t.parse::<EventType>().ok())
        .unwrap_or(EventType::Discussion);

    let author = obj
        .get("author")
        .or_else(|| obj.get("user"))
        .map(name_of)
        .unwrap_or_default();

    let title = obj.get("title").and_then(Value::as_str).unwrap_or("").trim();
    let body = obj
        .get("body")
        .or_else(|| obj.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let content = match (title.is_empty(), body.is_empty()) {
        (false, false) => format!("{}\n\n{}", title, body),
        (false, true) => title.to_string(),
        _ => body.to_string(),
    };

    let file_refs = string_list(obj.get("files"), &["path", "filename"]);
    let mut feature_refs = string_list(obj.get("features"), &["name"]);
    for label in string_list(obj.get("labels"), &["name"]) {
        if !feature_refs.contains(&label) {
            feature_refs.push(label);
        }
    }

    let thread_id = ["thread", "thread_id", "thread_ts"]
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    let metadata: Metadata = obj
        .iter()
        .filter(|(k, _)| !KNOWN_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), MetadataValue::from(v.clone())))
        .collect();

    Some(NormalizedEvent {
        platform_id: raw.platform_id,
        event_type,
        timestamp: raw.occurred_at,
        author,
        content,
        platform: raw.platform,
        file_refs,
        feature_refs,
        thread_id,
        metadata,
    })
}

/// A person as a plain string or an object with `login` / `name`.
fn name_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(o) => ["login", "name", "username"]
            .iter()
            .find_map(|k| o.get(*k).and_then(Value::as_str))
            .unwrap_or("")
            .to_string(),
        _ => String::new(),
    }
}

/// Strings from an array of strings or of objects carrying one of `keys`.
fn string_list(value: Option<&Value>, keys: &[&str]) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let s = match item {
            Value::String(s) => Some(s.as_str()),
            Value::Object(o) => keys.iter().find_map(|k| o.get(*k).and_then(Value::as_str)),
            _ => None,
        };
        if let Some(s) = s.map(str::trim).filter(|s| !s.is_empty()) {
            if !out.iter().any(|existing| existing == s) {
                out.push(s.to_string());
            }
        }
    }
    out
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
