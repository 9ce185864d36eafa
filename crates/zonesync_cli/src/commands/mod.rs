//! CLI command implementations.

pub mod compact;
pub mod dump_queue;
pub mod inspect;
pub mod repair;

use std::path::Path;
use zonesync_engine::SyncMeta;

/// Opens an existing journal for writing. Unlike [`SyncMeta::open_path`]
/// this never creates one.
///
/// Fails while an engine holds the journal.
pub fn open_existing(path: &Path) -> Result<SyncMeta, Box<dyn std::error::Error>> {
    ensure_exists(path)?;
    Ok(SyncMeta::open_path(path)?)
}

/// Opens an existing journal without ever writing to it.
pub fn open_for_reading(path: &Path) -> Result<SyncMeta, Box<dyn std::error::Error>> {
    ensure_exists(path)?;
    Ok(SyncMeta::open_path_read_only(path)?)
}

fn ensure_exists(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No sync journal found at {}", path.display()).into());
    }
    Ok(())
}
