//! Plain-text reports printed by the `ctx-ingest` CLI.

use chrono::{DateTime, Utc};

use context_ingest_core::store::{
    EntityCounts, ProjectDataSource, ProjectIntegration, ProjectWorkspace,
};

use crate::connector::ConnectorRegistry;
use crate::orchestrator::{CycleOutcome, CycleReport, IngestionHealth, StartReport};

fn when(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string())
}

pub fn list_connectors(registry: &ConnectorRegistry) {
    if registry.is_empty() {
        println!("No connectors configured.");
        return;
    }
    println!("{:<16} {:<24} VERSION", "PLATFORM", "NAME");
    for info in registry.describe_all() {
        println!("{:<16} {:<24} {}", info.name, info.display_name, info.version);
    }
}

pub fn print_projects(projects: &[ProjectWorkspace]) {
    if projects.is_empty() {
        println!("No projects.");
        return;
    }
    println!("{:<38} {:<24} CREATED", "ID", "NAME");
    for p in projects {
        println!(
            "{:<38} {:<24} {}",
            p.id,
            p.name,
            p.created_at.format("%Y-%m-%d")
        );
    }
}

pub fn print_integrations(integrations: &[ProjectIntegration]) {
    if integrations.is_empty() {
        println!("No integrations.");
        return;
    }
    println!(
        "{:<38} {:<12} {:<10} {:<20} EVENTS",
        "ID", "PLATFORM", "STATUS", "LAST SYNC"
    );
    for i in integrations {
        println!(
            "{:<38} {:<12} {:<10} {:<20} {}",
            i.id,
            i.platform,
            i.status,
            when(i.last_sync_at),
            i.sync_checkpoint.total_events_processed
        );
        if let Some(message) = &i.error_message {
            println!("    error: {}", message);
        }
    }
}

pub fn print_data_sources(sources: &[ProjectDataSource]) {
    if sources.is_empty() {
        println!("No data sources.");
        return;
    }
    println!("{:<38} {:<12} {:<28} NAME", "INTEGRATION", "TYPE", "EXTERNAL ID");
    for s in sources {
        println!(
            "{:<38} {:<12} {:<28} {}",
            s.integration_id, s.source_type, s.external_id, s.name
        );
    }
}

pub fn print_health(health: &IngestionHealth) {
    println!("Project:      {}", health.project_id);
    println!("Overall:      {}", health.overall_status);
    println!(
        "Integrations: {} total, {} active, {} failed, {} running",
        health.total_integrations,
        health.active_integrations,
        health.failed_integrations,
        health.running_ingestions
    );
    if health.integrations.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<38} {:<12} {:<10} {:<20} LAST RESULT",
        "INTEGRATION", "PLATFORM", "STATUS", "LAST SYNC"
    );
    for i in &health.integrations {
        let last = i.last_sync_status.map(|s| s.as_str()).unwrap_or("-");
        println!(
            "{:<38} {:<12} {:<10} {:<20} {}",
            i.integration_id,
            i.platform,
            i.status,
            when(i.last_sync_at),
            last
        );
        if let Some(message) = &i.error_message {
            println!("    error: {}", message);
        }
    }
}

pub fn print_start_report(report: &StartReport) {
    println!(
        "Started {} ingestion task(s), {} already running, {} failed.",
        report.started.len(),
        report.already_running.len(),
        report.failed.len()
    );
    for (id, reason) in &report.failed {
        println!("  {} failed: {}", id, reason);
    }
}

pub fn print_cycle_report(report: &CycleReport) {
    match report.outcome {
        CycleOutcome::Cancelled => {
            println!("Sync of {} was cancelled; nothing saved.", report.integration_id);
            return;
        }
        CycleOutcome::Halted => {
            println!(
                "Sync of {} skipped: integration is not active (see `integration reset`).",
                report.integration_id
            );
            return;
        }
        CycleOutcome::Completed => {}
    }
    println!("Sync of {} complete.", report.integration_id);
    println!("  fetched:       {}", report.fetched);
    println!("  duplicates:    {}", report.duplicates);
    println!("  processed:     {}", report.processed);
    println!("  entities:      {}", report.entities);
    println!("  relationships: {}", report.relationships);
    println!("  errors:        {}", report.errors);
}

pub fn print_entity_counts(counts: &EntityCounts) {
    println!("Stored knowledge:");
    println!("  decisions:     {}", counts.decisions);
    println!("  discussions:   {}", counts.discussions);
    println!("  features:      {}", counts.features);
    println!("  file contexts: {}", counts.file_contexts);
    println!("  contributors:  {}", counts.contributors);
    println!("  relationships: {}", counts.relationships);
    println!("  errors:        {}", counts.errors);
}
