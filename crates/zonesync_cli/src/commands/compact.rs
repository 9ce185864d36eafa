//! Compact command implementation.

use std::path::Path;
use zonesync_engine::{JournalStats, SyncMeta};

/// Compaction statistics.
#[derive(Debug)]
pub struct CompactStats {
    /// Journal before compaction.
    pub before: JournalStats,
    /// Journal after compaction.
    pub after: JournalStats,
}

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut meta = super::open_existing(path)?;
    println!("Compacting sync journal at {}", path.display());
    println!();

    let stats = compact(&mut meta)?;
    println!("  Frames before: {}", stats.before.frames);
    println!("  Frames after:  {}", stats.after.frames);
    println!("  Size before:   {} bytes", stats.before.bytes);
    println!("  Size after:    {} bytes", stats.after.bytes);
    println!();
    println!("✓ Compaction complete");
    Ok(())
}

/// Rewrites the journal as one snapshot frame.
pub fn compact(meta: &mut SyncMeta) -> Result<CompactStats, Box<dyn std::error::Error>> {
    let before = meta.stats()?;
    meta.compact()?;
    let after = meta.stats()?;
    Ok(CompactStats { before, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_journal::seeded;

    #[test]
    fn compaction_keeps_entries() {
        let (_dir, path) = seeded();
        let mut meta = SyncMeta::open_path(&path).unwrap();
        let stats = compact(&mut meta).unwrap();
        assert_eq!(stats.before.frames, 2);
        assert_eq!(stats.after.frames, 1);
        drop(meta);

        let reopened = SyncMeta::open_path(&path).unwrap();
        assert_eq!(reopened.state().len(), 3);
        assert!(reopened.state().cursor().is_some());
    }
}
