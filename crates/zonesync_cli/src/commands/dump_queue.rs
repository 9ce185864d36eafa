//! Dump-queue command implementation.

use crate::OutputFormat;
use std::path::Path;
use zonesync_engine::{EntryStatus, SyncMeta, SyncQueueEntry};

/// Runs the dump-queue command.
pub fn run(
    path: &Path,
    status: Option<EntryStatus>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let meta = super::open_for_reading(path)?;
    let entries = select(&meta, status);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Text => print_text_output(&entries),
    }
    Ok(())
}

/// Entries matching `status`, oldest change first.
pub fn select(meta: &SyncMeta, status: Option<EntryStatus>) -> Vec<SyncQueueEntry> {
    let mut entries: Vec<SyncQueueEntry> = meta
        .state()
        .entries()
        .filter(|e| status.map_or(true, |s| e.status == s))
        .cloned()
        .collect();
    entries.sort_by(|a, b| {
        a.last_modified_at
            .cmp(&b.last_modified_at)
            .then_with(|| a.remote_id.cmp(&b.remote_id))
    });
    entries
}

fn print_text_output(entries: &[SyncQueueEntry]) {
    println!("Queue Entries ({} total)", entries.len());
    println!("=====================");
    println!();

    for entry in entries {
        print!(
            "[{:10}] {:12} {} local={} modified={}",
            entry.status.as_str(),
            entry.entity_type,
            entry.remote_id,
            entry.local_ref,
            entry.last_modified_at.to_rfc3339()
        );
        for (name, target) in &entry.unresolved_refs {
            print!(" unresolved:{}={}", name, target);
        }
        println!();
    }
}
