use std::{fs, path::PathBuf};

use sqlx::{Row, SqlitePool, migrate::Migrator, sqlite::SqliteConnectOptions, sqlite::SqliteRow};
use thiserror::Error;

use super::paths::folder_aliases;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Batch reads are chunked to stay under SQLite's bind-parameter limit.
const READ_CHUNK: usize = 400;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid thumbnail status: {0}")]
    InvalidThumbStatus(String),
    #[error("invalid checkpoint status: {0}")]
    InvalidCheckpointStatus(String),
    #[error("invalid queue operation: {0}")]
    InvalidQueueOp(String),
    #[error("invalid queue status: {0}")]
    InvalidQueueStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThumbStatus {
    Pending,
    Ready,
    Failed,
    Skipped,
}

impl ThumbStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ThumbStatus::Pending => "pending",
            ThumbStatus::Ready => "ready",
            ThumbStatus::Failed => "failed",
            ThumbStatus::Skipped => "skipped",
        }
    }

    fn parse(value: &str) -> Result<Self, CatalogError> {
        match value {
            "pending" => Ok(ThumbStatus::Pending),
            "ready" => Ok(ThumbStatus::Ready),
            "failed" => Ok(ThumbStatus::Failed),
            "skipped" => Ok(ThumbStatus::Skipped),
            other => Err(CatalogError::InvalidThumbStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

impl CheckpointStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, CatalogError> {
        match value {
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(CatalogError::InvalidCheckpointStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    Upload,
    Delete,
}

impl QueueOp {
    fn as_str(&self) -> &'static str {
        match self {
            QueueOp::Upload => "upload",
            QueueOp::Delete => "delete",
        }
    }

    fn parse(value: &str) -> Result<Self, CatalogError> {
        match value {
            "upload" => Ok(QueueOp::Upload),
            "delete" => Ok(QueueOp::Delete),
            other => Err(CatalogError::InvalidQueueOp(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Uploading,
    Done,
    Failed,
}

impl QueueStatus {
    fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Uploading => "uploading",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, CatalogError> {
        match value {
            "pending" => Ok(QueueStatus::Pending),
            "uploading" => Ok(QueueStatus::Uploading),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(CatalogError::InvalidQueueStatus(other.to_string())),
        }
    }
}

/// Metadata fields of a media item, as written by the indexer. The
/// thumbnail fields are deliberately absent; the thumbnail service owns
/// those and the two are never written in the same statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItemInput {
    pub remote_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub last_modified: Option<i64>,
    pub capture_ts: Option<i64>,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub folder_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaItemRecord {
    pub remote_path: String,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub last_modified: Option<i64>,
    pub capture_ts: Option<i64>,
    pub etag: Option<String>,
    pub file_id: Option<String>,
    pub folder_path: String,
    pub thumb_path: Option<String>,
    pub thumb_status: ThumbStatus,
    pub thumb_retry_count: i64,
    pub thumb_last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointRecord {
    pub folder_path: String,
    pub last_sync_ts: i64,
    pub last_etag: Option<String>,
    pub status: CheckpointStatus,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntryInput {
    pub stable_key: String,
    pub op: QueueOp,
    pub local_uri: Option<String>,
    pub mime_type: String,
    pub byte_size: i64,
    pub capture_ts: Option<i64>,
    pub target_folder: String,
    pub target_name: String,
    pub resolved_remote_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub stable_key: String,
    pub op: QueueOp,
    pub local_uri: Option<String>,
    pub mime_type: String,
    pub byte_size: i64,
    pub capture_ts: Option<i64>,
    pub target_folder: String,
    pub target_name: String,
    pub status: QueueStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub resolved_remote_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub stable_key: String,
    pub remote_path: String,
    pub local_uri: Option<String>,
    pub byte_size: i64,
    pub capture_ts: Option<i64>,
    pub last_seen_at: i64,
    pub uploaded_at: Option<i64>,
    pub deleted_remotely_at: Option<i64>,
}

/// A thumbnail state transition, accumulated by the thumbnail service
/// and applied in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ThumbUpdate {
    Ready {
        remote_path: String,
        thumb_path: String,
    },
    Failed {
        remote_path: String,
        code: String,
    },
    Skipped {
        remote_path: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ThumbCounts {
    /// Items still eligible for backfill (pending, or failed below the
    /// retry budget).
    pub pending: i64,
    /// Items that burned their retry budget.
    pub exhausted: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueCounts {
    pub pending: i64,
    pub uploading: i64,
    pub failed: i64,
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
}

impl CatalogStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &PathBuf) -> Result<Self, CatalogError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), CatalogError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    // --- media items -----------------------------------------------------

    pub async fn upsert_media_metadata(&self, item: &MediaItemInput) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO media_items (
                remote_path, file_name, mime_type, byte_size, last_modified,
                capture_ts, etag, file_id, folder_path
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(remote_path) DO UPDATE SET
                file_name = excluded.file_name,
                mime_type = excluded.mime_type,
                byte_size = excluded.byte_size,
                last_modified = excluded.last_modified,
                capture_ts = excluded.capture_ts,
                etag = excluded.etag,
                file_id = excluded.file_id,
                folder_path = excluded.folder_path",
        )
        .bind(&item.remote_path)
        .bind(&item.file_name)
        .bind(&item.mime_type)
        .bind(item.byte_size)
        .bind(item.last_modified)
        .bind(item.capture_ts)
        .bind(&item.etag)
        .bind(&item.file_id)
        .bind(&item.folder_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_media_item(
        &self,
        remote_path: &str,
    ) -> Result<Option<MediaItemRecord>, CatalogError> {
        let row = sqlx::query(MEDIA_SELECT_BY_PATH)
            .bind(remote_path)
            .fetch_optional(&self.pool)
            .await?;
        row.map(media_from_row).transpose()
    }

    pub async fn list_media_by_paths(
        &self,
        paths: &[String],
    ) -> Result<Vec<MediaItemRecord>, CatalogError> {
        let mut out = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(READ_CHUNK) {
            let placeholders = (1..=chunk.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("{MEDIA_SELECT} WHERE remote_path IN ({placeholders})");
            let mut query = sqlx::query(&sql);
            for path in chunk {
                query = query.bind(path);
            }
            for row in query.fetch_all(&self.pool).await? {
                out.push(media_from_row(row)?);
            }
        }
        Ok(out)
    }

    pub async fn list_folder_media(
        &self,
        folder: &str,
    ) -> Result<Vec<MediaItemRecord>, CatalogError> {
        let [plain, with_slash] = folder_aliases(folder);
        let pattern = format!("{with_slash}%");
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT}
             WHERE folder_path = ?1 OR folder_path = ?2 OR folder_path LIKE ?3
             ORDER BY remote_path ASC"
        ))
        .bind(&plain)
        .bind(&with_slash)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(media_from_row).collect()
    }

    pub async fn count_media_items(&self) -> Result<i64, CatalogError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM media_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Deletes a catalog row together with its album references and
    /// returns the thumbnail path so the caller can remove the file.
    pub async fn prune_media_item(
        &self,
        remote_path: &str,
    ) -> Result<Option<String>, CatalogError> {
        let mut tx = self.pool.begin().await?;
        let thumb: Option<String> =
            sqlx::query("SELECT thumb_path FROM media_items WHERE remote_path = ?1")
                .bind(remote_path)
                .fetch_optional(&mut *tx)
                .await?
                .and_then(|row| row.try_get("thumb_path").ok());
        sqlx::query("DELETE FROM album_entries WHERE remote_path = ?1")
            .bind(remote_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM media_items WHERE remote_path = ?1")
            .bind(remote_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(thumb)
    }

    pub async fn add_album_entry(
        &self,
        album_path: &str,
        remote_path: &str,
    ) -> Result<(), CatalogError> {
        sqlx::query("INSERT OR IGNORE INTO album_entries (album_path, remote_path) VALUES (?1, ?2)")
            .bind(album_path)
            .bind(remote_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_album_entries_for(&self, remote_path: &str) -> Result<i64, CatalogError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM album_entries WHERE remote_path = ?1")
            .bind(remote_path)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // --- thumbnail state -------------------------------------------------

    /// Resets an item to pending and forgets the recorded file; used
    /// when the remote content changed or the file went missing.
    pub async fn set_thumb_pending(&self, remote_path: &str) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE media_items
             SET thumb_path = NULL, thumb_status = 'pending',
                 thumb_retry_count = 0, thumb_last_error = NULL
             WHERE remote_path = ?1",
        )
        .bind(remote_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn apply_thumb_updates(&self, updates: &[ThumbUpdate]) -> Result<(), CatalogError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for update in updates {
            match update {
                ThumbUpdate::Ready {
                    remote_path,
                    thumb_path,
                } => {
                    sqlx::query(
                        "UPDATE media_items
                         SET thumb_path = ?2, thumb_status = 'ready', thumb_last_error = NULL
                         WHERE remote_path = ?1",
                    )
                    .bind(remote_path)
                    .bind(thumb_path)
                    .execute(&mut *tx)
                    .await?;
                }
                ThumbUpdate::Failed { remote_path, code } => {
                    sqlx::query(
                        "UPDATE media_items
                         SET thumb_status = 'failed',
                             thumb_retry_count = thumb_retry_count + 1,
                             thumb_last_error = ?2
                         WHERE remote_path = ?1",
                    )
                    .bind(remote_path)
                    .bind(code)
                    .execute(&mut *tx)
                    .await?;
                }
                ThumbUpdate::Skipped {
                    remote_path,
                    reason,
                } => {
                    sqlx::query(
                        "UPDATE media_items
                         SET thumb_status = 'skipped', thumb_last_error = ?2
                         WHERE remote_path = ?1",
                    )
                    .bind(remote_path)
                    .bind(reason)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_thumb_backlog(
        &self,
        limit: i64,
        max_retries: i64,
    ) -> Result<Vec<MediaItemRecord>, CatalogError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT}
             WHERE thumb_status = 'pending'
                OR (thumb_status = 'failed' AND thumb_retry_count < ?1)
             ORDER BY CASE thumb_status WHEN 'pending' THEN 0 ELSE 1 END, remote_path ASC
             LIMIT ?2"
        ))
        .bind(max_retries)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(media_from_row).collect()
    }

    pub async fn thumb_counts(&self, max_retries: i64) -> Result<ThumbCounts, CatalogError> {
        let row = sqlx::query(
            "SELECT
                SUM(CASE WHEN thumb_status = 'pending'
                          OR (thumb_status = 'failed' AND thumb_retry_count < ?1)
                    THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN thumb_status = 'failed' AND thumb_retry_count >= ?1
                    THEN 1 ELSE 0 END) AS exhausted
             FROM media_items",
        )
        .bind(max_retries)
        .fetch_one(&self.pool)
        .await?;
        Ok(ThumbCounts {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            exhausted: row.try_get::<Option<i64>, _>("exhausted")?.unwrap_or(0),
        })
    }

    /// Most frequent thumbnail failure code among exhausted items, so
    /// the surfaced failure names the dominant cause.
    pub async fn dominant_thumb_error(
        &self,
        max_retries: i64,
    ) -> Result<Option<String>, CatalogError> {
        let row = sqlx::query(
            "SELECT thumb_last_error AS code, COUNT(*) AS n
             FROM media_items
             WHERE thumb_status = 'failed' AND thumb_retry_count >= ?1
               AND thumb_last_error IS NOT NULL
             GROUP BY thumb_last_error
             ORDER BY n DESC, code ASC
             LIMIT 1",
        )
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|row| row.try_get("code").ok()))
    }

    /// Candidates for the existence probe: failed/skipped thumbnails
    /// first, then ready items whose file may have gone missing.
    pub async fn probe_candidates(&self, limit: i64) -> Result<Vec<MediaItemRecord>, CatalogError> {
        let rows = sqlx::query(&format!(
            "{MEDIA_SELECT}
             ORDER BY CASE thumb_status
                 WHEN 'failed' THEN 0
                 WHEN 'skipped' THEN 1
                 WHEN 'ready' THEN 2
                 ELSE 3 END, remote_path ASC
             LIMIT ?1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(media_from_row).collect()
    }

    pub async fn requeue_exhausted_thumbs(&self, max_retries: i64) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE media_items
             SET thumb_status = 'pending', thumb_retry_count = 0, thumb_last_error = NULL
             WHERE thumb_status = 'failed' AND thumb_retry_count >= ?1",
        )
        .bind(max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // --- checkpoints -----------------------------------------------------

    pub async fn upsert_checkpoint(&self, record: &CheckpointRecord) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO sync_checkpoints (
                folder_path, last_sync_ts, last_etag, status,
                last_error_code, last_error_message
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(folder_path) DO UPDATE SET
                last_sync_ts = excluded.last_sync_ts,
                last_etag = excluded.last_etag,
                status = excluded.status,
                last_error_code = excluded.last_error_code,
                last_error_message = excluded.last_error_message",
        )
        .bind(&record.folder_path)
        .bind(record.last_sync_ts)
        .bind(&record.last_etag)
        .bind(record.status.as_str())
        .bind(&record.last_error_code)
        .bind(&record.last_error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(
        &self,
        folder_path: &str,
    ) -> Result<Option<CheckpointRecord>, CatalogError> {
        let row = sqlx::query(
            "SELECT folder_path, last_sync_ts, last_etag, status, last_error_code,
                    last_error_message
             FROM sync_checkpoints WHERE folder_path = ?1",
        )
        .bind(folder_path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(checkpoint_from_row).transpose()
    }

    // --- upload queue ----------------------------------------------------

    /// Inserts a queue entry unless a pending/uploading entry already
    /// exists for the same identity and operation. Returns whether a
    /// row was inserted.
    pub async fn enqueue_entry(
        &self,
        input: &QueueEntryInput,
        now: i64,
    ) -> Result<bool, CatalogError> {
        let result = sqlx::query(
            "INSERT INTO upload_queue (
                stable_key, op, local_uri, mime_type, byte_size, capture_ts,
                target_folder, target_name, status, created_at, updated_at,
                resolved_remote_path
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9, ?10
            WHERE NOT EXISTS (
                SELECT 1 FROM upload_queue
                WHERE stable_key = ?1 AND op = ?2
                  AND status IN ('pending', 'uploading')
            )",
        )
        .bind(&input.stable_key)
        .bind(input.op.as_str())
        .bind(&input.local_uri)
        .bind(&input.mime_type)
        .bind(input.byte_size)
        .bind(input.capture_ts)
        .bind(&input.target_folder)
        .bind(&input.target_name)
        .bind(now)
        .bind(&input.resolved_remote_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Entries left in `uploading` by a run that died mid-flight are
    /// returned to `pending` so the next drain picks them up.
    pub async fn requeue_stuck_uploads(&self, now: i64) -> Result<u64, CatalogError> {
        let result = sqlx::query(
            "UPDATE upload_queue
             SET status = 'pending', updated_at = ?1
             WHERE status = 'uploading'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn next_upload_batch(
        &self,
        limit: i64,
        now: i64,
    ) -> Result<Vec<QueueEntry>, CatalogError> {
        let rows = sqlx::query(&format!(
            "{QUEUE_SELECT}
             WHERE status = 'pending'
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
             ORDER BY COALESCE(next_attempt_at, created_at) ASC, id ASC
             LIMIT ?2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(queue_from_row).collect()
    }

    pub async fn mark_uploading(&self, id: i64, now: i64) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE upload_queue
             SET status = 'uploading', last_attempt_at = ?2, updated_at = ?2
             WHERE id = ?1",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn complete_entry(
        &self,
        id: i64,
        resolved_remote_path: &str,
        now: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE upload_queue
             SET status = 'done', resolved_remote_path = ?2, last_error = NULL,
                 next_attempt_at = NULL, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(resolved_remote_path)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn retry_entry(
        &self,
        id: i64,
        next_attempt_at: i64,
        error: &str,
        now: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE upload_queue
             SET status = 'pending', retry_count = retry_count + 1,
                 next_attempt_at = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?1",
        )
        .bind(id)
        .bind(next_attempt_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_entry(&self, id: i64, error: &str, now: i64) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE upload_queue
             SET status = 'failed', retry_count = retry_count + 1,
                 next_attempt_at = NULL, last_error = ?2, updated_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_queue_entry(&self, id: i64) -> Result<Option<QueueEntry>, CatalogError> {
        let row = sqlx::query(&format!("{QUEUE_SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(queue_from_row).transpose()
    }

    pub async fn prune_done_entries(&self, cutoff: i64) -> Result<u64, CatalogError> {
        let result = sqlx::query("DELETE FROM upload_queue WHERE status = 'done' AND updated_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, CatalogError> {
        let row = sqlx::query(
            "SELECT
                SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) AS pending,
                SUM(CASE WHEN status = 'uploading' THEN 1 ELSE 0 END) AS uploading,
                SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END) AS failed
             FROM upload_queue",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueCounts {
            pending: row.try_get::<Option<i64>, _>("pending")?.unwrap_or(0),
            uploading: row.try_get::<Option<i64>, _>("uploading")?.unwrap_or(0),
            failed: row.try_get::<Option<i64>, _>("failed")?.unwrap_or(0),
        })
    }

    // --- uploaded registry -----------------------------------------------

    /// Records that these identities were observed in the latest local
    /// scan, without touching their upload provenance.
    pub async fn touch_registry_seen(
        &self,
        items: &[(String, String, i64, Option<i64>)],
        now: i64,
    ) -> Result<(), CatalogError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (stable_key, local_uri, byte_size, capture_ts) in items {
            sqlx::query(
                "INSERT INTO uploaded_registry (
                    stable_key, remote_path, local_uri, byte_size, capture_ts, last_seen_at
                )
                VALUES (?1, '', ?2, ?3, ?4, ?5)
                ON CONFLICT(stable_key) DO UPDATE SET
                    local_uri = excluded.local_uri,
                    byte_size = excluded.byte_size,
                    capture_ts = COALESCE(excluded.capture_ts, uploaded_registry.capture_ts),
                    last_seen_at = excluded.last_seen_at",
            )
            .bind(stable_key)
            .bind(local_uri)
            .bind(byte_size)
            .bind(capture_ts)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_uploaded(
        &self,
        stable_key: &str,
        remote_path: &str,
        local_uri: Option<&str>,
        byte_size: i64,
        capture_ts: Option<i64>,
        now: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query(
            "INSERT INTO uploaded_registry (
                stable_key, remote_path, local_uri, byte_size, capture_ts,
                last_seen_at, uploaded_at, deleted_remotely_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, NULL)
            ON CONFLICT(stable_key) DO UPDATE SET
                remote_path = excluded.remote_path,
                local_uri = COALESCE(excluded.local_uri, uploaded_registry.local_uri),
                byte_size = excluded.byte_size,
                capture_ts = COALESCE(excluded.capture_ts, uploaded_registry.capture_ts),
                uploaded_at = excluded.uploaded_at,
                deleted_remotely_at = NULL",
        )
        .bind(stable_key)
        .bind(remote_path)
        .bind(local_uri)
        .bind(byte_size)
        .bind(capture_ts)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_registry_deleted(
        &self,
        stable_key: &str,
        now: i64,
    ) -> Result<(), CatalogError> {
        sqlx::query("UPDATE uploaded_registry SET deleted_remotely_at = ?2 WHERE stable_key = ?1")
            .bind(stable_key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_registry(
        &self,
        stable_key: &str,
    ) -> Result<Option<RegistryRecord>, CatalogError> {
        let row = sqlx::query(&format!("{REGISTRY_SELECT} WHERE stable_key = ?1"))
            .bind(stable_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(registry_from_row).transpose()
    }

    /// Items that were durably backed up and not yet mirror-deleted;
    /// the detector diffs these against the current scan.
    pub async fn list_backed_up_active(&self) -> Result<Vec<RegistryRecord>, CatalogError> {
        let rows = sqlx::query(&format!(
            "{REGISTRY_SELECT}
             WHERE uploaded_at IS NOT NULL AND deleted_remotely_at IS NULL
             ORDER BY stable_key ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(registry_from_row).collect()
    }
}

const MEDIA_SELECT: &str = "SELECT remote_path, file_name, mime_type, byte_size, last_modified, \
     capture_ts, etag, file_id, folder_path, thumb_path, thumb_status, \
     thumb_retry_count, thumb_last_error FROM media_items";

const MEDIA_SELECT_BY_PATH: &str = "SELECT remote_path, file_name, mime_type, byte_size, last_modified, \
     capture_ts, etag, file_id, folder_path, thumb_path, thumb_status, \
     thumb_retry_count, thumb_last_error FROM media_items WHERE remote_path = ?1";

const QUEUE_SELECT: &str = "SELECT id, stable_key, op, local_uri, mime_type, byte_size, capture_ts, \
     target_folder, target_name, status, created_at, updated_at, last_attempt_at, \
     next_attempt_at, retry_count, last_error, resolved_remote_path FROM upload_queue";

const REGISTRY_SELECT: &str = "SELECT stable_key, remote_path, local_uri, byte_size, capture_ts, \
     last_seen_at, uploaded_at, deleted_remotely_at FROM uploaded_registry";

fn media_from_row(row: SqliteRow) -> Result<MediaItemRecord, CatalogError> {
    let thumb_status: String = row.try_get("thumb_status")?;
    Ok(MediaItemRecord {
        remote_path: row.try_get("remote_path")?,
        file_name: row.try_get("file_name")?,
        mime_type: row.try_get("mime_type")?,
        byte_size: row.try_get("byte_size")?,
        last_modified: row.try_get("last_modified")?,
        capture_ts: row.try_get("capture_ts")?,
        etag: row.try_get("etag")?,
        file_id: row.try_get("file_id")?,
        folder_path: row.try_get("folder_path")?,
        thumb_path: row.try_get("thumb_path")?,
        thumb_status: ThumbStatus::parse(&thumb_status)?,
        thumb_retry_count: row.try_get("thumb_retry_count")?,
        thumb_last_error: row.try_get("thumb_last_error")?,
    })
}

fn checkpoint_from_row(row: SqliteRow) -> Result<CheckpointRecord, CatalogError> {
    let status: String = row.try_get("status")?;
    Ok(CheckpointRecord {
        folder_path: row.try_get("folder_path")?,
        last_sync_ts: row.try_get("last_sync_ts")?,
        last_etag: row.try_get("last_etag")?,
        status: CheckpointStatus::parse(&status)?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
    })
}

fn queue_from_row(row: SqliteRow) -> Result<QueueEntry, CatalogError> {
    let op: String = row.try_get("op")?;
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        stable_key: row.try_get("stable_key")?,
        op: QueueOp::parse(&op)?,
        local_uri: row.try_get("local_uri")?,
        mime_type: row.try_get("mime_type")?,
        byte_size: row.try_get("byte_size")?,
        capture_ts: row.try_get("capture_ts")?,
        target_folder: row.try_get("target_folder")?,
        target_name: row.try_get("target_name")?,
        status: QueueStatus::parse(&status)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        resolved_remote_path: row.try_get("resolved_remote_path")?,
    })
}

fn registry_from_row(row: SqliteRow) -> Result<RegistryRecord, CatalogError> {
    Ok(RegistryRecord {
        stable_key: row.try_get("stable_key")?,
        remote_path: row.try_get("remote_path")?,
        local_uri: row.try_get("local_uri")?,
        byte_size: row.try_get("byte_size")?,
        capture_ts: row.try_get("capture_ts")?,
        last_seen_at: row.try_get("last_seen_at")?,
        uploaded_at: row.try_get("uploaded_at")?,
        deleted_remotely_at: row.try_get("deleted_remotely_at")?,
    })
}
