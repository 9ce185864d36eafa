//! Cursor and queue repair commands.
//!
//! Both commands commit a single frame, so an interrupted run leaves the
//! journal either untouched or fully repaired.

use std::path::Path;
use tracing::info;
use zonesync_engine::SyncMeta;

/// Runs the reset-cursor command.
pub fn reset_cursor(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut meta = super::open_existing(path)?;
    if reset_cursor_in(&mut meta)? {
        println!("✓ Change cursor cleared; the next session reads the whole feed");
    } else {
        println!("No change cursor stored");
    }
    Ok(())
}

/// Clears the cursor. Returns false if none was stored.
pub fn reset_cursor_in(meta: &mut SyncMeta) -> Result<bool, Box<dyn std::error::Error>> {
    let mut cursor = meta.cursor_store();
    if cursor.current().is_none() {
        return Ok(false);
    }
    cursor.reset();
    meta.commit()?;
    info!("change cursor reset");
    Ok(true)
}

/// Runs the clear-queue command.
pub fn clear_queue(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut meta = super::open_existing(path)?;
    let removed = clear_queue_in(&mut meta)?;
    println!("✓ Removed {} queue entries and the change cursor", removed);
    Ok(())
}

/// Drops every entry and the cursor. Returns the number of entries removed.
pub fn clear_queue_in(meta: &mut SyncMeta) -> Result<usize, Box<dyn std::error::Error>> {
    let removed = meta.state().len();
    meta.tracker().clear();
    meta.cursor_store().reset();
    meta.commit()?;
    info!(removed, "sync queue cleared");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_journal::seeded;

    #[test]
    fn reset_cursor_persists() {
        let (_dir, path) = seeded();
        let mut meta = SyncMeta::open_path(&path).unwrap();
        assert!(reset_cursor_in(&mut meta).unwrap());
        assert!(!reset_cursor_in(&mut meta).unwrap());
        drop(meta);

        let reopened = SyncMeta::open_path(&path).unwrap();
        assert!(reopened.state().cursor().is_none());
        assert_eq!(reopened.state().len(), 3);
    }

    #[test]
    fn clear_queue_drops_entries_and_cursor() {
        let (_dir, path) = seeded();
        let mut meta = SyncMeta::open_path(&path).unwrap();
        assert_eq!(clear_queue_in(&mut meta).unwrap(), 3);
        drop(meta);

        let reopened = SyncMeta::open_path(&path).unwrap();
        assert!(reopened.state().is_empty());
        assert!(reopened.state().cursor().is_none());
    }
}
