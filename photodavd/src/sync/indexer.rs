use std::{
    collections::{HashSet, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use photodav_core::{ErrorClass, RemoteEntry, WebdavClient, WebdavError};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::scheduler::CancelFlag;

use super::backoff::Backoff;
use super::catalog::{
    CatalogError, CatalogStore, CheckpointRecord, CheckpointStatus, MediaItemInput,
    MediaItemRecord, ThumbStatus,
};
use super::local_media::mime_for_path;
use super::paths::{folder_of, is_under, normalize_remote_path, thumbnail_path_for};

/// Concurrent folder scans per pass.
const FOLDER_CONCURRENCY: usize = 3;
/// Whole-pass retries when every folder fails transiently.
const MAX_PASS_ATTEMPTS: u32 = 3;
/// Items sampled by one existence probe.
const PROBE_LIMIT: i64 = 25;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassStatus {
    Completed,
    Partial,
    Failed { code: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderFailure {
    pub folder: String,
    pub code: String,
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOutcome {
    pub synced: u64,
    pub pruned: u64,
    pub failed_folders: Vec<FolderFailure>,
    pub status: PassStatus,
}

impl IndexOutcome {
    pub fn to_json(&self) -> Value {
        let (status, error_code) = match &self.status {
            PassStatus::Completed => ("completed", None),
            PassStatus::Partial => ("partial", None),
            PassStatus::Failed { code } => ("failed", Some(code.clone())),
        };
        json!({
            "synced": self.synced,
            "pruned": self.pruned,
            "status": status,
            "error_code": error_code,
            "failed_folders": self.failed_folders.iter().map(|failure| json!({
                "folder": failure.folder,
                "code": failure.code,
                "transient": failure.transient,
            })).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug, Default)]
struct FolderScan {
    synced: u64,
    pruned: u64,
    failure: Option<FolderFailure>,
}

#[derive(Debug, Default)]
struct PassResult {
    synced: u64,
    pruned: u64,
    failed: Vec<FolderFailure>,
    folder_count: usize,
}

/// Enumerates selected remote folders into the catalog and prunes rows
/// for media that no longer exists remotely.
#[derive(Clone)]
pub struct RemoteIndexer {
    client: Arc<WebdavClient>,
    catalog: CatalogStore,
    thumb_root: PathBuf,
}

impl RemoteIndexer {
    pub fn new(client: Arc<WebdavClient>, catalog: CatalogStore, thumb_root: PathBuf) -> Self {
        Self {
            client,
            catalog,
            thumb_root,
        }
    }

    pub async fn index_selected_folders(
        &self,
        folders: &[String],
        cancel: &CancelFlag,
    ) -> Result<IndexOutcome, IndexError> {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), true);
        let mut attempt: u32 = 0;
        loop {
            let pass = self.scan_all(folders, cancel).await?;
            attempt += 1;

            let all_failed = pass.folder_count > 0 && pass.failed.len() == pass.folder_count;
            let uniformly_transient =
                all_failed && pass.failed.iter().all(|failure| failure.transient);
            if uniformly_transient && attempt < MAX_PASS_ATTEMPTS && !cancel.is_stopped() {
                let delay = backoff.delay(attempt - 1);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "all folders failed transiently, retrying pass"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return Ok(finalize(pass));
        }
    }

    async fn scan_all(
        &self,
        folders: &[String],
        cancel: &CancelFlag,
    ) -> Result<PassResult, IndexError> {
        let semaphore = Arc::new(Semaphore::new(FOLDER_CONCURRENCY));
        let mut handles = Vec::with_capacity(folders.len());
        for folder in folders {
            if cancel.is_stopped() {
                break;
            }
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let indexer = self.clone();
            let folder = folder.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let scan = indexer.scan_folder(&folder, &cancel).await;
                drop(permit);
                scan
            }));
        }

        let mut result = PassResult {
            folder_count: handles.len(),
            ..PassResult::default()
        };
        for handle in handles {
            match handle.await {
                Ok(Ok(scan)) => {
                    result.synced += scan.synced;
                    result.pruned += scan.pruned;
                    if let Some(failure) = scan.failure {
                        result.failed.push(failure);
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    tracing::error!("folder scan task panicked: {join_err}");
                }
            }
        }
        Ok(result)
    }

    async fn scan_folder(&self, folder: &str, cancel: &CancelFlag) -> Result<FolderScan, IndexError> {
        let folder = normalize_remote_path(folder);
        let now = unix_now();

        let listing = match self.list_tree(&folder, cancel).await {
            Ok(entries) => Ok(entries),
            Err(err) if err.class() == ErrorClass::NotFound => {
                let pruned = self.purge_folder(&folder).await?;
                self.write_checkpoint(&folder, now, None, CheckpointStatus::Completed, None, None)
                    .await?;
                return Ok(FolderScan {
                    pruned,
                    ..FolderScan::default()
                });
            }
            Err(err) => Err(err),
        };

        let entries = match listing {
            Ok(entries) => entries,
            Err(err) => {
                let failure = folder_failure(&folder, &err);
                self.write_checkpoint(
                    &folder,
                    now,
                    None,
                    CheckpointStatus::Failed,
                    Some(failure.code.clone()),
                    Some(err.to_string()),
                )
                .await?;
                return Ok(FolderScan {
                    failure: Some(failure),
                    ..FolderScan::default()
                });
            }
        };

        let folder_etag = entries
            .iter()
            .find(|entry| entry.is_collection && normalize_remote_path(&entry.path) == folder)
            .and_then(|entry| entry.etag.clone());

        let mut scan = FolderScan::default();
        let mut seen = HashSet::new();
        let media: Vec<&RemoteEntry> = entries
            .iter()
            .filter(|entry| !entry.is_collection && is_under(&folder, &entry.path))
            .collect();
        let paths: Vec<String> = media
            .iter()
            .map(|entry| normalize_remote_path(&entry.path))
            .collect();
        let existing = self.catalog.list_media_by_paths(&paths).await?;
        let existing_by_path: std::collections::HashMap<&str, &MediaItemRecord> = existing
            .iter()
            .map(|record| (record.remote_path.as_str(), record))
            .collect();

        for entry in &media {
            if cancel.is_stopped() {
                // A cancelled folder never prunes; the result set is
                // incomplete.
                return Ok(scan);
            }
            let Some(mime_type) = media_mime(entry) else {
                continue;
            };
            let remote_path = normalize_remote_path(&entry.path);
            let previous = existing_by_path.get(remote_path.as_str()).copied();
            let capture_ts = entry
                .created
                .or_else(|| previous.and_then(|record| record.capture_ts));
            let item = MediaItemInput {
                remote_path: remote_path.clone(),
                file_name: entry.file_name().to_string(),
                mime_type,
                byte_size: entry.byte_size.unwrap_or(0) as i64,
                last_modified: entry.last_modified,
                capture_ts,
                etag: entry.etag.clone(),
                file_id: entry.file_id.clone(),
                folder_path: folder_of(&remote_path),
            };
            self.catalog.upsert_media_metadata(&item).await?;
            if let Some(previous) = previous
                && !self.thumbnail_still_valid(previous, &item).await
            {
                self.catalog.set_thumb_pending(&remote_path).await?;
            }
            seen.insert(remote_path);
            scan.synced += 1;
        }

        if cancel.is_stopped() {
            return Ok(scan);
        }

        for record in self.catalog.list_folder_media(&folder).await? {
            if !seen.contains(&record.remote_path) {
                self.prune_item(&record.remote_path).await?;
                scan.pruned += 1;
            }
        }

        self.write_checkpoint(&folder, now, folder_etag, CheckpointStatus::Completed, None, None)
            .await?;
        Ok(scan)
    }

    /// Lists a folder's whole subtree. Servers that reject recursive
    /// PROPFIND get a breadth-first walk of single-level listings, so
    /// the result set still covers every nested item and pruning over
    /// the subtree stays safe.
    async fn list_tree(
        &self,
        folder: &str,
        cancel: &CancelFlag,
    ) -> Result<Vec<RemoteEntry>, WebdavError> {
        match self.client.list_recursive(folder).await {
            Ok(entries) => Ok(entries),
            Err(err) if err.class() == ErrorClass::NotFound => Err(err),
            Err(recursive_err) => {
                tracing::debug!(
                    folder,
                    code = %recursive_err.code(),
                    "recursive listing rejected, walking level by level"
                );
                self.list_breadth_first(folder, cancel).await
            }
        }
    }

    async fn list_breadth_first(
        &self,
        folder: &str,
        cancel: &CancelFlag,
    ) -> Result<Vec<RemoteEntry>, WebdavError> {
        let mut collected = Vec::new();
        let mut queue = VecDeque::from([folder.to_string()]);
        while let Some(current) = queue.pop_front() {
            if cancel.is_stopped() {
                // Incomplete walk; the caller's cancel checks keep it
                // from pruning against this.
                break;
            }
            let entries = match self.client.list_folder(&current).await {
                Ok(entries) => entries,
                // A subfolder deleted between listings simply drops out;
                // its rows fall to the prune pass as unseen.
                Err(err) if err.class() == ErrorClass::NotFound && current != folder => continue,
                Err(err) => return Err(err),
            };
            for entry in &entries {
                let path = normalize_remote_path(&entry.path);
                if entry.is_collection && path != current && is_under(folder, &path) {
                    queue.push_back(path);
                }
            }
            collected.extend(entries);
        }
        Ok(collected)
    }

    /// Thumbnail state survives a resync only when every metadata field
    /// is unchanged and the cached file is actually on disk.
    async fn thumbnail_still_valid(&self, previous: &MediaItemRecord, item: &MediaItemInput) -> bool {
        if previous.thumb_status == ThumbStatus::Pending {
            return true;
        }
        let unchanged = previous.etag == item.etag
            && previous.byte_size == item.byte_size
            && previous.last_modified == item.last_modified
            && previous.capture_ts == item.capture_ts
            && previous.file_id == item.file_id;
        if !unchanged {
            return false;
        }
        if previous.thumb_status != ThumbStatus::Ready {
            return true;
        }
        let file = previous
            .thumb_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| thumbnail_path_for(&self.thumb_root, &previous.remote_path));
        tokio::fs::try_exists(&file).await.unwrap_or(false)
    }

    /// A 404 on the folder itself is an authoritative server-side
    /// deletion; everything nested under it goes.
    async fn purge_folder(&self, folder: &str) -> Result<u64, IndexError> {
        let mut pruned = 0;
        for record in self.catalog.list_folder_media(folder).await? {
            self.prune_item(&record.remote_path).await?;
            pruned += 1;
        }
        tracing::info!(folder, pruned, "purged folder deleted server-side");
        Ok(pruned)
    }

    async fn prune_item(&self, remote_path: &str) -> Result<(), IndexError> {
        let thumb = self.catalog.prune_media_item(remote_path).await?;
        let file = thumb
            .map(PathBuf::from)
            .unwrap_or_else(|| thumbnail_path_for(&self.thumb_root, remote_path));
        if let Err(err) = tokio::fs::remove_file(&file).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %file.display(), "failed to remove thumbnail file: {err}");
        }
        Ok(())
    }

    /// Bounded single-file existence probe. Folder listings cannot see
    /// the deletion of an individual file whose siblings are stable, so
    /// a small sample is HEAD-checked each pass.
    pub async fn probe_missing_items(&self, cancel: &CancelFlag) -> Result<u64, IndexError> {
        let mut pruned = 0;
        for record in self.catalog.probe_candidates(PROBE_LIMIT).await? {
            if cancel.is_stopped() {
                break;
            }
            let worth_probing = match record.thumb_status {
                ThumbStatus::Failed | ThumbStatus::Skipped => true,
                ThumbStatus::Ready => {
                    let file = record
                        .thumb_path
                        .as_ref()
                        .map(PathBuf::from)
                        .unwrap_or_else(|| {
                            thumbnail_path_for(&self.thumb_root, &record.remote_path)
                        });
                    !tokio::fs::try_exists(&file).await.unwrap_or(false)
                }
                ThumbStatus::Pending => false,
            };
            if !worth_probing {
                continue;
            }
            match self.client.head(&record.remote_path).await {
                Ok(info) if !info.exists => {
                    self.prune_item(&record.remote_path).await?;
                    pruned += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(path = record.remote_path, code = %err.code(), "existence probe failed");
                }
            }
        }
        Ok(pruned)
    }

    async fn write_checkpoint(
        &self,
        folder: &str,
        now: i64,
        last_etag: Option<String>,
        status: CheckpointStatus,
        code: Option<String>,
        message: Option<String>,
    ) -> Result<(), IndexError> {
        self.catalog
            .upsert_checkpoint(&CheckpointRecord {
                folder_path: folder.to_string(),
                last_sync_ts: now,
                last_etag,
                status,
                last_error_code: code,
                last_error_message: message,
            })
            .await?;
        Ok(())
    }
}

fn finalize(pass: PassResult) -> IndexOutcome {
    let status = if pass.failed.is_empty() {
        PassStatus::Completed
    } else if pass.failed.len() < pass.folder_count {
        PassStatus::Partial
    } else {
        PassStatus::Failed {
            code: aggregate_code(&pass.failed),
        }
    };
    IndexOutcome {
        synced: pass.synced,
        pruned: pass.pruned,
        failed_folders: pass.failed,
        status,
    }
}

/// One code when every folder failed the same way, "mixed" otherwise.
fn aggregate_code(failures: &[FolderFailure]) -> String {
    let mut codes = failures.iter().map(|failure| failure.code.as_str());
    let Some(first) = codes.next() else {
        return "unknown".to_string();
    };
    if codes.all(|code| code == first) {
        first.to_string()
    } else {
        "mixed".to_string()
    }
}

fn folder_failure(folder: &str, err: &WebdavError) -> FolderFailure {
    FolderFailure {
        folder: folder.to_string(),
        code: err.code(),
        transient: err.is_transient(),
    }
}

fn media_mime(entry: &RemoteEntry) -> Option<String> {
    if let Some(content_type) = &entry.content_type
        && (content_type.starts_with("image/") || content_type.starts_with("video/"))
    {
        return Some(content_type.clone());
    }
    mime_for_path(std::path::Path::new(&entry.path)).map(str::to_string)
}

fn unix_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::catalog::ThumbUpdate;
    use sqlx::SqlitePool;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn make_catalog() -> CatalogStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let store = CatalogStore::from_pool(pool);
        store.init().await.unwrap();
        store
    }

    fn client_for(server: &MockServer) -> Arc<WebdavClient> {
        Arc::new(
            WebdavClient::with_endpoints(
                &format!("{}/dav", server.uri()),
                &format!("{}/preview", server.uri()),
                "alice",
                "secret",
            )
            .unwrap(),
        )
    }

    fn multistatus(folder: &str, files: &[(&str, u64, &str)]) -> String {
        let mut body = String::from(
            r#"<?xml version="1.0"?><d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">"#,
        );
        body.push_str(&format!(
            "<d:response><d:href>/dav{folder}/</d:href><d:propstat><d:prop>\
             <d:resourcetype><d:collection/></d:resourcetype><d:getetag>\"folder-etag\"</d:getetag>\
             </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>"
        ));
        for (file_path, size, etag) in files {
            body.push_str(&format!(
                "<d:response><d:href>/dav{file_path}</d:href><d:propstat><d:prop>\
                 <d:resourcetype/><d:getcontentlength>{size}</d:getcontentlength>\
                 <d:getcontenttype>image/jpeg</d:getcontenttype>\
                 <d:getlastmodified>Fri, 15 Mar 2024 10:00:00 GMT</d:getlastmodified>\
                 <d:getetag>\"{etag}\"</d:getetag>\
                 </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>"
            ));
        }
        body.push_str("</d:multistatus>");
        body
    }

    fn propfind(on_path: &str) -> wiremock::MockBuilder {
        Mock::given(method("PROPFIND")).and(path(on_path.to_string()))
    }

    #[tokio::test]
    async fn second_pass_with_no_remote_changes_prunes_nothing() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos",
                &[("/Photos/a.jpg", 100, "e1"), ("/Photos/b.jpg", 200, "e2")],
            )))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let folders = vec!["/Photos".to_string()];
        let cancel = CancelFlag::new();

        let first = indexer.index_selected_folders(&folders, &cancel).await.unwrap();
        assert_eq!(first.status, PassStatus::Completed);
        assert_eq!(first.synced, 2);
        assert_eq!(first.pruned, 0);

        let second = indexer.index_selected_folders(&folders, &cancel).await.unwrap();
        assert_eq!(second.pruned, 0);
        assert_eq!(catalog.count_media_items().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unchanged_items_keep_their_ready_thumbnails() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos",
                &[("/Photos/a.jpg", 100, "e1")],
            )))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let folders = vec!["/Photos".to_string()];
        let cancel = CancelFlag::new();
        indexer.index_selected_folders(&folders, &cancel).await.unwrap();

        let thumb_file = thumbs.path().join("a-thumb.jpg");
        std::fs::write(&thumb_file, b"thumbnail").unwrap();
        catalog
            .apply_thumb_updates(&[ThumbUpdate::Ready {
                remote_path: "/Photos/a.jpg".into(),
                thumb_path: thumb_file.to_string_lossy().into_owned(),
            }])
            .await
            .unwrap();

        indexer.index_selected_folders(&folders, &cancel).await.unwrap();
        let record = catalog.get_media_item("/Photos/a.jpg").await.unwrap().unwrap();
        assert_eq!(record.thumb_status, ThumbStatus::Ready);

        // A changed etag resets the thumbnail to pending.
        server.reset().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos",
                &[("/Photos/a.jpg", 100, "e2")],
            )))
            .mount(&server)
            .await;
        indexer.index_selected_folders(&folders, &cancel).await.unwrap();
        let record = catalog.get_media_item("/Photos/a.jpg").await.unwrap().unwrap();
        assert_eq!(record.thumb_status, ThumbStatus::Pending);
        assert!(record.thumb_path.is_none());
    }

    #[tokio::test]
    async fn stale_rows_under_a_scanned_folder_are_pruned() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos",
                &[("/Photos/keep.jpg", 100, "e1")],
            )))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        let thumbs = TempDir::new().unwrap();
        let stale_thumb = thumbs.path().join("stale.jpg");
        std::fs::write(&stale_thumb, b"old").unwrap();
        catalog
            .upsert_media_metadata(&MediaItemInput {
                remote_path: "/Photos/stale.jpg".into(),
                file_name: "stale.jpg".into(),
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
        catalog
            .apply_thumb_updates(&[ThumbUpdate::Ready {
                remote_path: "/Photos/stale.jpg".into(),
                thumb_path: stale_thumb.to_string_lossy().into_owned(),
            }])
            .await
            .unwrap();

        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let outcome = indexer
            .index_selected_folders(&["/Photos".to_string()], &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome.pruned, 1);
        assert!(catalog.get_media_item("/Photos/stale.jpg").await.unwrap().is_none());
        assert!(!stale_thumb.exists());
        assert!(catalog.get_media_item("/Photos/keep.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn depth_one_fallback_walks_nested_folders_before_pruning() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .and(header("Depth", "infinity"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;
        // Top level: one file plus the trip subfolder.
        let top = multistatus("/Photos", &[("/Photos/cover.jpg", 100, "e1")]).replace(
            "</d:multistatus>",
            "<d:response><d:href>/dav/Photos/trip/</d:href><d:propstat><d:prop>\
             <d:resourcetype><d:collection/></d:resourcetype>\
             </d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>\
             </d:multistatus>",
        );
        propfind("/dav/Photos")
            .and(header("Depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(top))
            .mount(&server)
            .await;
        propfind("/dav/Photos/trip")
            .and(header("Depth", "1"))
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos/trip",
                &[("/Photos/trip/nested.jpg", 200, "e2")],
            )))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        // Indexed by an earlier recursive pass.
        catalog
            .upsert_media_metadata(&MediaItemInput {
                remote_path: "/Photos/trip/nested.jpg".into(),
                file_name: "nested.jpg".into(),
                mime_type: "image/jpeg".into(),
                byte_size: 200,
                last_modified: None,
                capture_ts: None,
                etag: None,
                file_id: None,
                folder_path: "/Photos/trip".into(),
            })
            .await
            .unwrap();

        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let outcome = indexer
            .index_selected_folders(&["/Photos".to_string()], &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, PassStatus::Completed);
        assert_eq!(outcome.synced, 2);
        assert_eq!(outcome.pruned, 0);
        assert!(catalog.get_media_item("/Photos/trip/nested.jpg").await.unwrap().is_some());
        assert!(catalog.get_media_item("/Photos/cover.jpg").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn partial_failure_leaves_the_failed_folder_untouched() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(207).set_body_string(multistatus(
                "/Photos",
                &[("/Photos/a.jpg", 100, "e1")],
            )))
            .mount(&server)
            .await;
        propfind("/dav/Videos")
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        // A pre-existing row under the failing folder must survive.
        catalog
            .upsert_media_metadata(&MediaItemInput {
                remote_path: "/Videos/clip.mp4".into(),
                file_name: "clip.mp4".into(),
                mime_type: "video/mp4".into(),
                byte_size: 1,
                last_modified: None,
                capture_ts: None,
                etag: None,
                file_id: None,
                folder_path: "/Videos".into(),
            })
            .await
            .unwrap();

        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let outcome = indexer
            .index_selected_folders(
                &["/Photos".to_string(), "/Videos".to_string()],
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, PassStatus::Partial);
        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.failed_folders.len(), 1);
        assert_eq!(outcome.failed_folders[0].code, "http_503");
        assert!(outcome.failed_folders[0].transient);
        assert!(catalog.get_media_item("/Videos/clip.mp4").await.unwrap().is_some());

        let checkpoint = catalog.get_checkpoint("/Videos").await.unwrap().unwrap();
        assert_eq!(checkpoint.status, CheckpointStatus::Failed);
        assert_eq!(checkpoint.last_error_code.as_deref(), Some("http_503"));
        let ok = catalog.get_checkpoint("/Photos").await.unwrap().unwrap();
        assert_eq!(ok.status, CheckpointStatus::Completed);
    }

    #[tokio::test]
    async fn uniformly_transient_pass_is_retried_whole() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog,
            thumbs.path().to_path_buf(),
        );
        let outcome = indexer
            .index_selected_folders(&["/Photos".to_string()], &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.status,
            PassStatus::Failed {
                code: "http_503".to_string()
            }
        );
        // Three pass attempts, each trying recursive then single-level.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 6);
    }

    #[tokio::test]
    async fn not_found_folder_is_purged_not_failed() {
        let server = MockServer::start().await;
        propfind("/dav/Photos")
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        catalog
            .upsert_media_metadata(&MediaItemInput {
                remote_path: "/Photos/gone.jpg".into(),
                file_name: "gone.jpg".into(),
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

        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let outcome = indexer
            .index_selected_folders(&["/Photos".to_string()], &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, PassStatus::Completed);
        assert_eq!(outcome.pruned, 1);
        assert!(catalog.get_media_item("/Photos/gone.jpg").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn probe_prunes_items_confirmed_missing() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/dav/Photos/lost.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/dav/Photos/kept.jpg"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let catalog = make_catalog().await;
        for name in ["lost", "kept"] {
            catalog
                .upsert_media_metadata(&MediaItemInput {
                    remote_path: format!("/Photos/{name}.jpg"),
                    file_name: format!("{name}.jpg"),
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
            catalog
                .apply_thumb_updates(&[ThumbUpdate::Failed {
                    remote_path: format!("/Photos/{name}.jpg"),
                    code: "http_500".into(),
                }])
                .await
                .unwrap();
        }

        let thumbs = TempDir::new().unwrap();
        let indexer = RemoteIndexer::new(
            client_for(&server),
            catalog.clone(),
            thumbs.path().to_path_buf(),
        );
        let pruned = indexer.probe_missing_items(&CancelFlag::new()).await.unwrap();
        assert_eq!(pruned, 1);
        assert!(catalog.get_media_item("/Photos/lost.jpg").await.unwrap().is_none());
        assert!(catalog.get_media_item("/Photos/kept.jpg").await.unwrap().is_some());
    }

    #[test]
    fn aggregate_code_distinguishes_uniform_from_mixed() {
        let uniform = vec![
            FolderFailure {
                folder: "/a".into(),
                code: "http_503".into(),
                transient: true,
            },
            FolderFailure {
                folder: "/b".into(),
                code: "http_503".into(),
                transient: true,
            },
        ];
        assert_eq!(aggregate_code(&uniform), "http_503");

        let mixed = vec![
            FolderFailure {
                folder: "/a".into(),
                code: "http_503".into(),
                transient: true,
            },
            FolderFailure {
                folder: "/b".into(),
                code: "http_401".into(),
                transient: false,
            },
        ];
        assert_eq!(aggregate_code(&mixed), "mixed");
    }
}
