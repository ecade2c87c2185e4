use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

use crate::scheduler::CancelFlag;

use super::catalog::{CatalogError, CatalogStore, QueueEntryInput, QueueOp};
use super::local_media::{MediaSource, MediaSourceError, MimeFilter, ScanScope};
use super::paths::folder_of;

/// Terminal Done queue rows are kept this long for diagnostics.
const DONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Source(#[from] MediaSourceError),
    #[error("scan task failed: {0}")]
    Scan(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectOutcome {
    pub inserted: u64,
    pub deletes: u64,
}

impl DetectOutcome {
    pub fn has_new_work(&self) -> bool {
        self.inserted > 0 || self.deletes > 0
    }

    pub fn to_json(&self) -> Value {
        json!({
            "inserted": self.inserted,
            "deletes": self.deletes,
        })
    }
}

/// What the detector backs up, and where.
#[derive(Clone)]
pub struct BackupPolicy {
    pub scope: ScanScope,
    pub mime_filter: MimeFilter,
    pub target_folder: String,
    pub mirror_deletes: bool,
}

/// Diffs the device media source against the uploaded registry and
/// emits upload/delete intents into the durable queue.
pub struct ChangeDetector {
    source: Arc<dyn MediaSource>,
    catalog: CatalogStore,
    policy: BackupPolicy,
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn MediaSource>, catalog: CatalogStore, policy: BackupPolicy) -> Self {
        Self {
            source,
            catalog,
            policy,
        }
    }

    pub async fn detect_and_queue(&self, cancel: &CancelFlag) -> Result<DetectOutcome, DetectError> {
        let source = Arc::clone(&self.source);
        let scope = self.policy.scope.clone();
        let filter = self.policy.mime_filter;
        let items = tokio::task::spawn_blocking(move || source.scan(&scope, filter))
            .await
            .map_err(|err| DetectError::Scan(err.to_string()))??;

        let now = unix_now();
        let mut outcome = DetectOutcome::default();
        for item in &items {
            if cancel.is_stopped() {
                return Ok(outcome);
            }
            // Already durably backed up and unchanged: nothing to queue.
            // The seen-refresh below overwrites the registry size with
            // the scanned one, so the comparison must run first.
            if let Some(registry) = self.catalog.get_registry(&item.stable_key).await?
                && registry.uploaded_at.is_some()
                && registry.deleted_remotely_at.is_none()
                && registry.byte_size == item.byte_size
            {
                continue;
            }
            let entry = QueueEntryInput {
                stable_key: item.stable_key.clone(),
                op: QueueOp::Upload,
                local_uri: Some(item.local_uri.clone()),
                mime_type: item.mime_type.clone(),
                byte_size: item.byte_size,
                capture_ts: item.capture_ts,
                target_folder: self.policy.target_folder.clone(),
                target_name: item.file_name.clone(),
                resolved_remote_path: None,
            };
            if self.catalog.enqueue_entry(&entry, now).await? {
                outcome.inserted += 1;
            }
        }

        let seen: Vec<(String, String, i64, Option<i64>)> = items
            .iter()
            .map(|item| {
                (
                    item.stable_key.clone(),
                    item.local_uri.clone(),
                    item.byte_size,
                    item.capture_ts,
                )
            })
            .collect();
        self.catalog.touch_registry_seen(&seen, now).await?;

        if self.policy.mirror_deletes {
            let present: std::collections::HashSet<&str> = items
                .iter()
                .map(|item| item.stable_key.as_str())
                .collect();
            for registry in self.catalog.list_backed_up_active().await? {
                if cancel.is_stopped() {
                    return Ok(outcome);
                }
                if present.contains(registry.stable_key.as_str()) {
                    continue;
                }
                let file_name = registry
                    .remote_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(registry.remote_path.as_str())
                    .to_string();
                let entry = QueueEntryInput {
                    stable_key: registry.stable_key.clone(),
                    op: QueueOp::Delete,
                    local_uri: None,
                    mime_type: "application/octet-stream".to_string(),
                    byte_size: registry.byte_size,
                    capture_ts: registry.capture_ts,
                    target_folder: folder_of(&registry.remote_path),
                    target_name: file_name,
                    resolved_remote_path: Some(registry.remote_path.clone()),
                };
                if self.catalog.enqueue_entry(&entry, now).await? {
                    outcome.deletes += 1;
                }
            }
        }

        let cutoff = now - DONE_RETENTION.as_secs() as i64;
        let pruned = self.catalog.prune_done_entries(cutoff).await?;
        if pruned > 0 {
            tracing::debug!(pruned, "aged out terminal queue entries");
        }

        Ok(outcome)
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
