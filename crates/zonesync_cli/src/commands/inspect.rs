//! Inspect command implementation.

use crate::OutputFormat;
use serde::Serialize;
use std::path::Path;
use zonesync_engine::{EntryStatus, SyncMeta};

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal size in bytes.
    pub journal_size: u64,
    /// Frames in the journal.
    pub frames: usize,
    /// Queue entries.
    pub entries: usize,
    /// Entries in agreement with the zone.
    pub clean: usize,
    /// Entries waiting to be saved.
    pub dirty: usize,
    /// Entries waiting to be deleted.
    pub tombstoned: usize,
    /// Entries with references that could not be linked.
    pub unresolved: usize,
    /// Whether a change cursor is stored.
    pub has_cursor: bool,
    /// Stored cursor length in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_size: Option<usize>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let meta = super::open_for_reading(path)?;
    let result = inspect(path, &meta)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

/// Collects counts from an opened journal.
pub fn inspect(path: &Path, meta: &SyncMeta) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let stats = meta.stats()?;
    let state = meta.state();
    let cursor_size = state.cursor().map(|c| c.as_bytes().len());

    Ok(InspectResult {
        path: path.display().to_string(),
        journal_size: stats.bytes,
        frames: stats.frames,
        entries: state.len(),
        clean: state.count_by_status(EntryStatus::Clean),
        dirty: state.count_by_status(EntryStatus::Dirty),
        tombstoned: state.count_by_status(EntryStatus::Tombstoned),
        unresolved: state
            .entries()
            .filter(|e| !e.unresolved_refs.is_empty())
            .count(),
        has_cursor: cursor_size.is_some(),
        cursor_size,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("zonesync Journal Inspection");
    println!("===========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size:    {}", format_size(result.journal_size));
    println!("  Frames:  {}", result.frames);
    println!();
    println!("Queue:");
    println!("  Entries:     {}", result.entries);
    println!("  Clean:       {}", result.clean);
    println!("  Dirty:       {}", result.dirty);
    println!("  Tombstoned:  {}", result.tombstoned);
    println!("  Unresolved:  {}", result.unresolved);
    println!();
    match result.cursor_size {
        Some(size) => println!("Cursor: stored ({size} bytes)"),
        None => println!("Cursor: none (next session reads the whole feed)"),
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
