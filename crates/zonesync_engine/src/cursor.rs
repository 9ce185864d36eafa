//! Change cursor store.

use crate::meta::{MetaOp, SyncMeta};
use tracing::debug;
use zonesync_record::ChangeCursor;

/// Typed access to the stored change-feed position.
///
/// The cursor is stored verbatim. `None` means the next pull starts from the
/// beginning of the feed.
pub struct ChangeCursorStore<'a> {
    meta: &'a mut SyncMeta,
}

impl<'a> ChangeCursorStore<'a> {
    pub(crate) fn new(meta: &'a mut SyncMeta) -> Self {
        Self { meta }
    }

    /// The stored cursor.
    pub fn current(&self) -> Option<ChangeCursor> {
        self.meta.state().cursor().cloned()
    }

    /// Stores `cursor` if one was returned. Returns true if it was stored.
    pub fn advance(&mut self, cursor: Option<ChangeCursor>) -> bool {
        match cursor {
            Some(cursor) => {
                if self.meta.state().cursor() != Some(&cursor) {
                    self.meta.apply(MetaOp::SetCursor(Some(cursor)));
                }
                true
            }
            None => false,
        }
    }

    /// Forgets the cursor so the next pull refetches everything.
    pub fn reset(&mut self) {
        if self.meta.state().cursor().is_some() {
            debug!("resetting change cursor");
            self.meta.apply(MetaOp::SetCursor(None));
        }
    }
}
