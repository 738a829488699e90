//! Background compaction of expired rate limit records
//!
//! The request path never deletes documents, so without compaction every
//! (endpoint, scope, identifier) ever seen would stay in the store. Compaction
//! runs outside the request path and only removes documents that can no
//! longer influence a decision:
//! - sliding-window logs whose newest entry is older than the longest window
//! - fixed-window buckets whose window has ended

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::error::StoreError;
use super::store::{TransactionalStore, TxWrite};
use crate::clock::Clock;

/// Result of one compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Documents inspected
    pub scanned: usize,

    /// Documents removed
    pub removed: usize,
}

fn is_expired(doc: &serde_json::Value, now_ms: i64, horizon_ms: i64) -> bool {
    if let Some(requests) = doc.get("requests").and_then(|r| r.as_array()) {
        let newest = requests.iter().filter_map(|t| t.as_i64()).max();
        return match newest {
            Some(newest) => newest < now_ms - horizon_ms,
            None => true,
        };
    }
    if let Some(window_end) = doc.get("windowEnd").and_then(|w| w.as_i64()) {
        return window_end <= now_ms;
    }
    false
}

/// Remove expired documents under `prefix`
///
/// `max_window` must be at least the longest window of any policy writing
/// under `prefix`. Each removal re-checks expiry inside a transaction so a
/// concurrent admission is never lost.
pub async fn compact(
    store: &dyn TransactionalStore,
    prefix: &str,
    now_ms: i64,
    max_window: Duration,
) -> Result<CompactionReport, StoreError> {
    let horizon_ms = max_window.as_millis() as i64;
    let keys = store.keys(prefix).await?;
    let mut report = CompactionReport {
        scanned: keys.len(),
        removed: 0,
    };

    for key in keys {
        let mut removed = false;
        store
            .run_transaction(&key, &mut |doc| {
                removed = false;
                match doc {
                    Some(doc) if is_expired(doc, now_ms, horizon_ms) => {
                        removed = true;
                        Ok(TxWrite::Delete)
                    }
                    _ => Ok(TxWrite::Keep),
                }
            })
            .await?;
        if removed {
            report.removed += 1;
        }
    }

    tracing::debug!(
        scanned = report.scanned,
        removed = report.removed,
        "Rate limit compaction finished"
    );
    Ok(report)
}

/// Run [`compact`] every `interval` until `cancel` fires
pub fn spawn_compaction(
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    max_window: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = compact(store.as_ref(), "", clock.now_ms(), max_window).await {
                tracing::error!("Rate limit compaction failed: {}", e);
            }
        }
        tracing::debug!("Rate limit compaction stopped");
    })
}
