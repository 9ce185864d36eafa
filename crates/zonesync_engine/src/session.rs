//! Borrowed view of everything one sync session touches.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{RemoteResult, SyncError, SyncResult};
use crate::meta::SyncMeta;
use crate::remote::RemoteStore;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tracing::warn;
use zonesync_record::ZoneId;

/// Collaborators of a running session.
///
/// Locks are always taken local first, then meta, and are released before
/// any remote call is awaited.
pub(crate) struct SessionContext<'a, L, R: ?Sized> {
    pub(crate) local: &'a Mutex<L>,
    pub(crate) meta: &'a Mutex<SyncMeta>,
    pub(crate) remote: &'a R,
    pub(crate) zone: &'a ZoneId,
    pub(crate) config: &'a SyncConfig,
    pub(crate) clock: &'a dyn Clock,
}

impl<'a, L, R: RemoteStore + ?Sized> SessionContext<'a, L, R> {
    /// Awaits a remote call under the configured request timeout.
    pub(crate) async fn call<T, F>(&self, operation: &'static str, fut: F) -> SyncResult<T>
    where
        F: Future<Output = RemoteResult<T>>,
    {
        timed(self.config.request_timeout, self.zone, operation, fut).await
    }
}

/// Awaits `fut` for at most `timeout`.
pub(crate) async fn timed<T, F>(
    timeout: Duration,
    zone: &ZoneId,
    operation: &'static str,
    fut: F,
) -> SyncResult<T>
where
    F: Future<Output = RemoteResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(zone = %zone, operation, error = %e, "remote call failed");
            Err(SyncError::Remote(e))
        }
        Err(_) => {
            warn!(
                zone = %zone,
                operation,
                timeout_ms = timeout.as_millis() as u64,
                "remote call timed out"
            );
            Err(SyncError::Timeout)
        }
    }
}
