use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use tokio::sync::watch;

use crate::scheduler::{DedupPolicy, JobFailure, JobScheduler, JobSnapshot, JobState};

use super::catalog::{CatalogError, CatalogStore};
use super::detector::ChangeDetector;
use super::indexer::{PassStatus, RemoteIndexer};
use super::thumbs::{MAX_THUMB_RETRIES, ThumbError, ThumbnailService};
use super::uploader::UploadProcessor;

pub const JOB_INDEX: &str = "remote-index";
pub const JOB_THUMBS: &str = "thumbnail-backfill";
pub const JOB_DETECT: &str = "change-detect";
pub const JOB_UPLOAD: &str = "upload-drain";

/// Items per thumbnail backfill round.
const BACKFILL_BATCH: i64 = 200;
/// Rapid local-change bursts coalesce into one upload pass.
const UPLOAD_DEBOUNCE: Duration = Duration::from_secs(3);
/// A backfill aborted by an unreachable host re-enqueues itself after
/// this long.
const UNREACHABLE_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Externally-visible sync state, derived from the indexer job plus
/// catalog aggregates. Background thumbnail work alone never raises
/// this to Running.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Running,
    Partial {
        pending_thumbs: i64,
        exhausted_thumbs: i64,
        dominant_error: Option<String>,
    },
    Completed,
    Failed {
        code: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackupStatus {
    Idle,
    Running,
    Completed,
    Failed { code: String },
}

/// Retained summary of the last completed upload drain, independent of
/// the live queue, so "last backup" survives an empty queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupRunSummary {
    pub uploaded: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub failed: u64,
    pub completed_at: i64,
}

pub struct SyncOrchestrator {
    scheduler: JobScheduler,
    catalog: CatalogStore,
    indexer: RemoteIndexer,
    thumbs: ThumbnailService,
    detector: Arc<ChangeDetector>,
    uploader: Arc<UploadProcessor>,
    folders: Vec<String>,
    sync_tx: watch::Sender<SyncStatus>,
    backup_tx: watch::Sender<BackupStatus>,
    last_backup: Mutex<Option<BackupRunSummary>>,
    /// One-shot guard so exhausted-thumbnail requeues cannot storm.
    retry_used: AtomicBool,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: JobScheduler,
        catalog: CatalogStore,
        indexer: RemoteIndexer,
        thumbs: ThumbnailService,
        detector: Arc<ChangeDetector>,
        uploader: Arc<UploadProcessor>,
        folders: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            catalog,
            indexer,
            thumbs,
            detector,
            uploader,
            folders,
            sync_tx: watch::channel(SyncStatus::Idle).0,
            backup_tx: watch::channel(BackupStatus::Idle).0,
            last_backup: Mutex::new(None),
            retry_used: AtomicBool::new(false),
        })
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncStatus> {
        self.sync_tx.subscribe()
    }

    pub fn subscribe_backup(&self) -> watch::Receiver<BackupStatus> {
        self.backup_tx.subscribe()
    }

    pub fn last_backup_run(&self) -> Option<BackupRunSummary> {
        match self.last_backup.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Schedules a full indexing pass, superseding any stale queued one.
    pub fn schedule_full(self: &Arc<Self>) {
        self.retry_used.store(false, Ordering::SeqCst);
        self.schedule_index(DedupPolicy::Replace);
    }

    /// Retries what actually needs retrying: exhausted thumbnails get a
    /// bounded one-shot requeue, anything else a full re-index.
    pub async fn retry(self: &Arc<Self>) -> Result<(), CatalogError> {
        let status = self.sync_tx.borrow().clone();
        if let SyncStatus::Partial {
            exhausted_thumbs, ..
        } = status
            && exhausted_thumbs > 0
            && !self.retry_used.swap(true, Ordering::SeqCst)
        {
            let requeued = self.catalog.requeue_exhausted_thumbs(MAX_THUMB_RETRIES).await?;
            tracing::info!(requeued, "requeued exhausted thumbnails for one more round");
            self.schedule_thumbs(DedupPolicy::Keep);
            return Ok(());
        }
        self.schedule_full();
        Ok(())
    }

    pub fn cancel_all(&self) {
        for name in [JOB_INDEX, JOB_THUMBS, JOB_DETECT, JOB_UPLOAD] {
            self.scheduler.cancel(name);
        }
    }

    /// User-initiated "sync everything now": local detection plus a
    /// full remote pass.
    pub fn request_combined_sync_now(self: &Arc<Self>) {
        self.schedule_detect(true, DedupPolicy::Replace);
        self.schedule_full();
    }

    pub fn schedule_detect(self: &Arc<Self>, manual: bool, policy: DedupPolicy) {
        let this = Arc::clone(self);
        self.scheduler.enqueue_unique(JOB_DETECT, policy, move |cancel| async move {
            let outcome = this
                .detector
                .detect_and_queue(&cancel)
                .await
                .map_err(|err| JobFailure::new("detect", err.to_string()))?;
            if (outcome.has_new_work() || manual) && !cancel.is_stopped() {
                tokio::time::sleep(UPLOAD_DEBOUNCE).await;
                this.schedule_upload(DedupPolicy::Keep);
            }
            Ok(outcome.to_json())
        });
    }

    pub fn schedule_upload(self: &Arc<Self>, policy: DedupPolicy) {
        let this = Arc::clone(self);
        self.scheduler.enqueue_unique(JOB_UPLOAD, policy, move |cancel| async move {
            let outcome = this
                .uploader
                .drain(&cancel)
                .await
                .map_err(|err| JobFailure::new("catalog", err.to_string()))?;
            this.record_backup_run(&outcome);
            if outcome.changed_remote {
                // Remote state changed under the indexer's feet; bring
                // the catalog back in line.
                this.schedule_index(DedupPolicy::Keep);
            }
            Ok(outcome.to_json())
        });
    }

    pub fn schedule_thumbs(self: &Arc<Self>, policy: DedupPolicy) {
        let this = Arc::clone(self);
        self.scheduler.enqueue_unique(JOB_THUMBS, policy, move |cancel| async move {
            let mut last = None;
            loop {
                if cancel.is_stopped() {
                    break;
                }
                match this.thumbs.backfill(BACKFILL_BATCH, &cancel).await {
                    Ok(outcome) => {
                        let done = !outcome.follow_up;
                        last = Some(outcome);
                        if done {
                            break;
                        }
                    }
                    Err(ThumbError::Unreachable) => {
                        if !cancel.is_stopped() {
                            let retry = Arc::clone(&this);
                            tokio::spawn(async move {
                                tokio::time::sleep(UNREACHABLE_RETRY_DELAY).await;
                                retry.schedule_thumbs(DedupPolicy::Keep);
                            });
                        }
                        return Err(JobFailure::new("unreachable", "host unreachable"));
                    }
                    Err(err) => {
                        return Err(JobFailure::new("thumbs", err.to_string()));
                    }
                }
            }
            Ok(last.map(|outcome| outcome.to_json()).unwrap_or_default())
        });
    }

    pub fn schedule_index(self: &Arc<Self>, policy: DedupPolicy) {
        let this = Arc::clone(self);
        self.scheduler.enqueue_unique(JOB_INDEX, policy, move |cancel| async move {
            let outcome = this
                .indexer
                .index_selected_folders(&this.folders, &cancel)
                .await
                .map_err(|err| JobFailure::new("catalog", err.to_string()))?;
            if let Err(err) = this.indexer.probe_missing_items(&cancel).await {
                tracing::warn!("existence probe failed: {err}");
            }
            let json = outcome.to_json();
            match outcome.status {
                PassStatus::Failed { code } => {
                    Err(JobFailure::new(code, "indexing pass failed for every folder"))
                }
                _ => {
                    this.schedule_thumbs(DedupPolicy::Keep);
                    Ok(json)
                }
            }
        });
    }

    fn record_backup_run(&self, outcome: &super::uploader::DrainOutcome) {
        let summary = BackupRunSummary {
            uploaded: outcome.uploaded,
            skipped: outcome.skipped,
            deleted: outcome.deleted,
            failed: outcome.failed,
            completed_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        };
        match self.last_backup.lock() {
            Ok(mut guard) => *guard = Some(summary),
            Err(poisoned) => *poisoned.into_inner() = Some(summary),
        }
    }

    /// Re-derives both status machines from job snapshots and catalog
    /// aggregates, publishing over the watch channels when changed.
    pub async fn refresh(&self) -> Result<(), CatalogError> {
        let sync = self.derive_sync_status().await?;
        self.sync_tx.send_if_modified(|current| {
            if *current != sync {
                *current = sync;
                true
            } else {
                false
            }
        });

        let backup = self.derive_backup_status();
        self.backup_tx.send_if_modified(|current| {
            if *current != backup {
                *current = backup;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn derive_sync_status(&self) -> Result<SyncStatus, CatalogError> {
        let snapshot = self.scheduler.snapshot(JOB_INDEX);
        if snapshot.as_ref().is_some_and(JobSnapshot::is_active) {
            return Ok(SyncStatus::Running);
        }

        let counts = self.catalog.thumb_counts(MAX_THUMB_RETRIES).await?;
        let backlog_remains = counts.pending > 0 || counts.exhausted > 0;
        let partial = || async {
            Ok::<_, CatalogError>(SyncStatus::Partial {
                pending_thumbs: counts.pending,
                exhausted_thumbs: counts.exhausted,
                dominant_error: self.catalog.dominant_thumb_error(MAX_THUMB_RETRIES).await?,
            })
        };

        match snapshot {
            Some(snapshot) if snapshot.state == JobState::Failed => Ok(SyncStatus::Failed {
                code: snapshot.error_code.unwrap_or_else(|| "unknown".to_string()),
            }),
            Some(snapshot) if snapshot.state == JobState::Succeeded => {
                let was_partial = snapshot
                    .output
                    .as_ref()
                    .and_then(|output| output.get("status"))
                    .and_then(|status| status.as_str())
                    == Some("partial");
                if backlog_remains || was_partial {
                    partial().await
                } else {
                    Ok(SyncStatus::Completed)
                }
            }
            // No history, or a cancelled run: leftover backlog still
            // degrades to Partial, but nothing escalates to Running.
            _ => {
                if backlog_remains {
                    partial().await
                } else {
                    Ok(SyncStatus::Idle)
                }
            }
        }
    }

    fn derive_backup_status(&self) -> BackupStatus {
        let snapshot = self.scheduler.snapshot(JOB_UPLOAD);
        if snapshot.as_ref().is_some_and(JobSnapshot::is_active) {
            return BackupStatus::Running;
        }
        match snapshot {
            Some(snapshot) if snapshot.state == JobState::Failed => BackupStatus::Failed {
                code: snapshot.error_code.unwrap_or_else(|| "unknown".to_string()),
            },
            Some(snapshot) if snapshot.state == JobState::Succeeded => BackupStatus::Completed,
            _ => BackupStatus::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::catalog::{MediaItemInput, ThumbUpdate};
    use crate::sync::detector::BackupPolicy;
    use crate::sync::local_media::{
        LocalMediaItem, MediaSource, MediaSourceError, MimeFilter, ScanScope,
    };
    use photodav_core::WebdavClient;
    use sqlx::SqlitePool;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;
    use wiremock::MockServer;

    struct EmptySource;

    impl MediaSource for EmptySource {
        fn scan(
            &self,
            _scope: &ScanScope,
            _filter: MimeFilter,
        ) -> Result<Vec<LocalMediaItem>, MediaSourceError> {
            Ok(Vec::new())
        }
    }

    async fn make_orchestrator(server: &MockServer) -> (Arc<SyncOrchestrator>, CatalogStore, TempDir) {
        make_orchestrator_at(
            &format!("{}/dav", server.uri()),
            &format!("{}/preview", server.uri()),
        )
        .await
    }

    async fn make_orchestrator_at(
        dav: &str,
        preview: &str,
    ) -> (Arc<SyncOrchestrator>, CatalogStore, TempDir) {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = CatalogStore::from_pool(pool);
        catalog.init().await.unwrap();
        let client = Arc::new(WebdavClient::with_endpoints(dav, preview, "alice", "secret").unwrap());
        let thumbs_dir = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            Arc::clone(&client),
            catalog.clone(),
            thumbs_dir.path().to_path_buf(),
        );
        let thumbs = ThumbnailService::new(
            Arc::clone(&client),
            catalog.clone(),
            thumbs_dir.path().to_path_buf(),
        );
        let detector = Arc::new(ChangeDetector::new(
            Arc::new(EmptySource),
            catalog.clone(),
            BackupPolicy {
                scope: ScanScope::EntireLibrary,
                mime_filter: MimeFilter::All,
                target_folder: "/Backups".to_string(),
                mirror_deletes: false,
            },
        ));
        let uploader = Arc::new(UploadProcessor::new(Arc::clone(&client), catalog.clone()));
        let orchestrator = SyncOrchestrator::new(
            JobScheduler::new(),
            catalog.clone(),
            indexer,
            thumbs,
            detector,
            uploader,
            vec!["/Photos".to_string()],
        );
        (orchestrator, catalog, thumbs_dir)
    }

    async fn seed_item(catalog: &CatalogStore, path: &str) {
        catalog
            .upsert_media_metadata(&MediaItemInput {
                remote_path: path.to_string(),
                file_name: path.rsplit('/').next().unwrap().to_string(),
                mime_type: "image/jpeg".into(),
                byte_size: 1,
                last_modified: None,
                capture_ts: None,
                etag: None,
                file_id: None,
                folder_path: "/Photos".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_state_is_idle_on_both_machines() {
        let server = MockServer::start().await;
        let (orchestrator, _catalog, _thumbs) = make_orchestrator(&server).await;
        orchestrator.refresh().await.unwrap();
        assert_eq!(*orchestrator.subscribe_sync().borrow(), SyncStatus::Idle);
        assert_eq!(*orchestrator.subscribe_backup().borrow(), BackupStatus::Idle);
    }

    #[tokio::test]
    async fn active_index_job_means_running() {
        let server = MockServer::start().await;
        let (orchestrator, _catalog, _thumbs) = make_orchestrator(&server).await;
        orchestrator
            .scheduler
            .enqueue_unique(JOB_INDEX, DedupPolicy::Keep, |cancel| async move {
                while !cancel.is_stopped() {
                    sleep(Duration::from_millis(5)).await;
                }
                Ok(serde_json::Value::Null)
            });
        orchestrator.refresh().await.unwrap();
        assert_eq!(*orchestrator.subscribe_sync().borrow(), SyncStatus::Running);
        orchestrator.cancel_all();
    }

    #[tokio::test]
    async fn thumbnail_backlog_degrades_to_partial_never_running() {
        let server = MockServer::start().await;
        let (orchestrator, catalog, _thumbs) = make_orchestrator(&server).await;
        seed_item(&catalog, "/Photos/a.jpg").await;

        orchestrator.refresh().await.unwrap();
        match &*orchestrator.subscribe_sync().borrow() {
            SyncStatus::Partial { pending_thumbs, .. } => assert_eq!(*pending_thumbs, 1),
            status => panic!("expected partial, got {status:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_failures_surface_their_dominant_code() {
        let server = MockServer::start().await;
        let (orchestrator, catalog, _thumbs) = make_orchestrator(&server).await;
        seed_item(&catalog, "/Photos/a.jpg").await;
        for _ in 0..MAX_THUMB_RETRIES {
            catalog
                .apply_thumb_updates(&[ThumbUpdate::Failed {
                    remote_path: "/Photos/a.jpg".into(),
                    code: "http_500".into(),
                }])
                .await
                .unwrap();
        }

        orchestrator.refresh().await.unwrap();
        match &*orchestrator.subscribe_sync().borrow() {
            SyncStatus::Partial {
                exhausted_thumbs,
                dominant_error,
                ..
            } => {
                assert_eq!(*exhausted_thumbs, 1);
                assert_eq!(dominant_error.as_deref(), Some("http_500"));
            }
            status => panic!("expected partial, got {status:?}"),
        }
    }

    #[tokio::test]
    async fn retry_requeues_exhausted_thumbs_exactly_once() {
        let server = MockServer::start().await;
        let (orchestrator, catalog, _thumbs) = make_orchestrator(&server).await;
        seed_item(&catalog, "/Photos/a.jpg").await;
        for _ in 0..MAX_THUMB_RETRIES {
            catalog
                .apply_thumb_updates(&[ThumbUpdate::Failed {
                    remote_path: "/Photos/a.jpg".into(),
                    code: "http_500".into(),
                }])
                .await
                .unwrap();
        }
        orchestrator.refresh().await.unwrap();

        orchestrator.retry().await.unwrap();
        // Stop the chained backfill before it can touch the counts.
        orchestrator.scheduler.cancel(JOB_THUMBS);
        let counts = catalog.thumb_counts(MAX_THUMB_RETRIES).await.unwrap();
        assert_eq!(counts.exhausted, 0);
        assert_eq!(counts.pending, 1);
        assert!(orchestrator.retry_used.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn unreachable_backfill_reschedules_itself() {
        // Nothing listens on port 9; every fetch is connect-refused.
        let (orchestrator, catalog, _thumbs) =
            make_orchestrator_at("http://127.0.0.1:9/dav", "http://127.0.0.1:9/preview").await;
        seed_item(&catalog, "/Photos/a.jpg").await;

        orchestrator.schedule_thumbs(DedupPolicy::Keep);
        let mut receiver = orchestrator.scheduler.observe(JOB_THUMBS);
        loop {
            let failed = receiver
                .borrow()
                .as_ref()
                .is_some_and(|snapshot| snapshot.state == JobState::Failed);
            if failed {
                break;
            }
            receiver.changed().await.unwrap();
        }
        assert_eq!(
            orchestrator
                .scheduler
                .snapshot(JOB_THUMBS)
                .unwrap()
                .error_code
                .as_deref(),
            Some("unreachable")
        );

        // Skip the retry delay; the re-enqueue must bring the job back
        // without any index pass or manual retry.
        tokio::time::pause();
        loop {
            let live = receiver.borrow().as_ref().is_some_and(JobSnapshot::is_active);
            if live {
                break;
            }
            receiver.changed().await.unwrap();
        }
        orchestrator.cancel_all();
    }

    #[tokio::test]
    async fn empty_drain_completes_backup_with_a_retained_summary() {
        let server = MockServer::start().await;
        let (orchestrator, _catalog, _thumbs) = make_orchestrator(&server).await;

        orchestrator.schedule_upload(DedupPolicy::Keep);
        let mut receiver = orchestrator.scheduler.observe(JOB_UPLOAD);
        loop {
            let done = receiver
                .borrow()
                .as_ref()
                .is_some_and(|snapshot| snapshot.state == JobState::Succeeded);
            if done {
                break;
            }
            receiver.changed().await.unwrap();
        }

        orchestrator.refresh().await.unwrap();
        assert_eq!(
            *orchestrator.subscribe_backup().borrow(),
            BackupStatus::Completed
        );
        let summary = orchestrator.last_backup_run().unwrap();
        assert_eq!(summary.uploaded, 0);
        assert_eq!(summary.failed, 0);
    }
}
