use std::sync::Arc;

use photodav_core::{WebdavClient, WebdavError};
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use crate::scheduler::CancelFlag;

use super::backoff::upload_retry_delay;
use super::catalog::{CatalogError, CatalogStore, QueueEntry, QueueOp};
use super::paths::join_remote;

/// Queue entries claimed per drain iteration.
const DRAIN_BATCH: i64 = 10;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainOutcome {
    pub uploaded: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    /// Set when remote state changed; the caller schedules a follow-up
    /// indexing pass to stay eventually consistent.
    pub changed_remote: bool,
}

impl DrainOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "uploaded": self.uploaded,
            "skipped": self.skipped,
            "deleted": self.deleted,
            "failed": self.failed,
            "changed_remote": self.changed_remote,
        })
    }
}

enum EntryOutcome {
    Uploaded(String),
    SkippedExisting(String),
    Deleted(String),
    Failure {
        code: String,
        message: String,
        transient: bool,
    },
}

/// Drains the durable upload queue against the remote store.
pub struct UploadProcessor {
    client: Arc<WebdavClient>,
    catalog: CatalogStore,
}

impl UploadProcessor {
    pub fn new(client: Arc<WebdavClient>, catalog: CatalogStore) -> Self {
        Self { client, catalog }
    }

    pub async fn drain(&self, cancel: &CancelFlag) -> Result<DrainOutcome, UploadError> {
        let mut outcome = DrainOutcome::default();

        // Entries stuck in Uploading belong to a run that died
        // mid-flight; give them back to the queue.
        let recovered = self.catalog.requeue_stuck_uploads(unix_now()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "requeued uploads stuck from a previous run");
        }

        'drain: loop {
            if cancel.is_stopped() {
                break;
            }
            let now = unix_now();
            let batch = self.catalog.next_upload_batch(DRAIN_BATCH, now).await?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if cancel.is_stopped() {
                    break 'drain;
                }
                let now = unix_now();
                self.catalog.mark_uploading(entry.id, now).await?;
                match self.process_entry(&entry).await {
                    EntryOutcome::Uploaded(resolved) => {
                        self.catalog.complete_entry(entry.id, &resolved, now).await?;
                        self.catalog
                            .record_uploaded(
                                &entry.stable_key,
                                &resolved,
                                entry.local_uri.as_deref(),
                                entry.byte_size,
                                entry.capture_ts,
                                now,
                            )
                            .await?;
                        outcome.uploaded += 1;
                        outcome.changed_remote = true;
                    }
                    EntryOutcome::SkippedExisting(resolved) => {
                        self.catalog.complete_entry(entry.id, &resolved, now).await?;
                        self.catalog
                            .record_uploaded(
                                &entry.stable_key,
                                &resolved,
                                entry.local_uri.as_deref(),
                                entry.byte_size,
                                entry.capture_ts,
                                now,
                            )
                            .await?;
                        outcome.skipped += 1;
                    }
                    EntryOutcome::Deleted(resolved) => {
                        self.catalog.complete_entry(entry.id, &resolved, now).await?;
                        self.catalog
                            .mark_registry_deleted(&entry.stable_key, now)
                            .await?;
                        outcome.deleted += 1;
                        outcome.changed_remote = true;
                    }
                    EntryOutcome::Failure {
                        code,
                        message,
                        transient,
                    } => {
                        tracing::warn!(
                            id = entry.id,
                            code,
                            transient,
                            "queue entry failed: {message}"
                        );
                        let next_delay =
                            transient.then(|| upload_retry_delay(entry.retry_count + 1)).flatten();
                        match next_delay {
                            Some(delay) => {
                                self.catalog
                                    .retry_entry(
                                        entry.id,
                                        now + delay.as_secs() as i64,
                                        &code,
                                        now,
                                    )
                                    .await?;
                            }
                            None => {
                                self.catalog.fail_entry(entry.id, &code, now).await?;
                                outcome.failed += 1;
                            }
                        }
                    }
                }
            }
        }
        Ok(outcome)
    }

    async fn process_entry(&self, entry: &QueueEntry) -> EntryOutcome {
        match entry.op {
            QueueOp::Upload => self.process_upload(entry).await,
            QueueOp::Delete => self.process_delete(entry).await,
        }
    }

    async fn process_upload(&self, entry: &QueueEntry) -> EntryOutcome {
        let Some(local_uri) = entry.local_uri.as_deref() else {
            return EntryOutcome::Failure {
                code: "local_missing".to_string(),
                message: "upload entry has no local uri".to_string(),
                transient: false,
            };
        };
        if tokio::fs::metadata(local_uri).await.is_err() {
            return EntryOutcome::Failure {
                code: "local_missing".to_string(),
                message: format!("local file no longer exists: {local_uri}"),
                transient: false,
            };
        }

        if let Err(err) = self.client.ensure_folder(&entry.target_folder).await {
            return failure_from(&err);
        }
        let resolved = join_remote(&entry.target_folder, &entry.target_name);

        match self.client.head(&resolved).await {
            Ok(info) if info.exists => {
                if info.byte_size == Some(entry.byte_size as u64) {
                    // Same bytes already there; uploading again would be
                    // pure waste.
                    return EntryOutcome::SkippedExisting(resolved);
                }
                // A different file occupies the target; blind overwrite
                // risks remote data loss.
                EntryOutcome::Failure {
                    code: "conflict".to_string(),
                    message: format!(
                        "remote {resolved} has size {:?}, local is {}",
                        info.byte_size, entry.byte_size
                    ),
                    transient: false,
                }
            }
            Ok(_) => {
                let file = match tokio::fs::File::open(local_uri).await {
                    Ok(file) => file,
                    Err(err) => {
                        return EntryOutcome::Failure {
                            code: "local_missing".to_string(),
                            message: err.to_string(),
                            transient: false,
                        };
                    }
                };
                let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
                match self
                    .client
                    .put(&resolved, body, &entry.mime_type, entry.byte_size as u64)
                    .await
                {
                    Ok(()) => EntryOutcome::Uploaded(resolved),
                    Err(err) => failure_from(&err),
                }
            }
            Err(err) => failure_from(&err),
        }
    }

    async fn process_delete(&self, entry: &QueueEntry) -> EntryOutcome {
        let resolved = entry
            .resolved_remote_path
            .clone()
            .unwrap_or_else(|| join_remote(&entry.target_folder, &entry.target_name));
        match self.client.delete(&resolved).await {
            Ok(()) => EntryOutcome::Deleted(resolved),
            Err(err) => failure_from(&err),
        }
    }
}

fn failure_from(err: &WebdavError) -> EntryOutcome {
    EntryOutcome::Failure {
        code: err.code(),
        message: err.to_string(),
        transient: err.is_transient(),
    }
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
