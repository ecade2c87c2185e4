use std::{io::Cursor, path::PathBuf, sync::Arc, time::Duration};

use futures_util::future::join_all;
use image::ImageReader;
use photodav_core::{ErrorClass, WebdavClient, WebdavError};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::time::Instant;

use crate::scheduler::CancelFlag;

use super::catalog::{CatalogError, CatalogStore, MediaItemRecord, ThumbUpdate};
use super::paths::thumbnail_path_for;

/// Items processed concurrently within a batch.
const THUMB_CONCURRENCY: usize = 4;
/// Per-item failure budget before an item is exhausted.
pub const MAX_THUMB_RETRIES: i64 = 3;
/// Target thumbnail edge in pixels.
const THUMB_SIZE: u32 = 512;
/// Buffered state writes flush after this many items.
const FLUSH_EVERY: usize = 20;
/// Or after this much wall time, whichever comes first.
const FLUSH_STALENESS: Duration = Duration::from_secs(2);
/// Decode guard for the transcode fallback.
const MAX_DECODE_EDGE: u32 = 16_384;
const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ThumbError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The host cannot be reached at all. The batch is aborted so a
    /// blanket outage does not burn every item's retry budget.
    #[error("host unreachable, batch aborted")]
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillOutcome {
    pub fetched: u64,
    pub pending: i64,
    pub exhausted: i64,
    pub follow_up: bool,
    pub dominant_error: Option<String>,
}

impl BackfillOutcome {
    pub fn to_json(&self) -> Value {
        json!({
            "fetched": self.fetched,
            "pending": self.pending,
            "exhausted": self.exhausted,
            "follow_up": self.follow_up,
            "dominant_error": self.dominant_error,
        })
    }
}

enum ItemOutcome {
    Ready(String),
    Failed(String),
    Skipped(String),
    Unreachable,
}

/// Fills in missing thumbnails through an ordered fallback chain: disk
/// cache hit, server preview, video frame extraction, local transcode.
#[derive(Clone)]
pub struct ThumbnailService {
    client: Arc<WebdavClient>,
    catalog: CatalogStore,
    thumb_root: PathBuf,
}

impl ThumbnailService {
    pub fn new(client: Arc<WebdavClient>, catalog: CatalogStore, thumb_root: PathBuf) -> Self {
        Self {
            client,
            catalog,
            thumb_root,
        }
    }

    pub async fn backfill(
        &self,
        batch_limit: i64,
        cancel: &CancelFlag,
    ) -> Result<BackfillOutcome, ThumbError> {
        tokio::fs::create_dir_all(&self.thumb_root).await?;
        let backlog = self
            .catalog
            .list_thumb_backlog(batch_limit, MAX_THUMB_RETRIES)
            .await?;

        let mut fetched: u64 = 0;
        let mut buffer: Vec<ThumbUpdate> = Vec::new();
        let mut last_flush = Instant::now();
        let mut first_success_flushed = false;

        for chunk in backlog.chunks(THUMB_CONCURRENCY) {
            if cancel.is_stopped() {
                break;
            }
            let outcomes = join_all(chunk.iter().map(|item| self.acquire_one(item))).await;
            let mut unreachable = false;
            for (item, outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    ItemOutcome::Ready(thumb_path) => {
                        fetched += 1;
                        buffer.push(ThumbUpdate::Ready {
                            remote_path: item.remote_path.clone(),
                            thumb_path,
                        });
                    }
                    ItemOutcome::Failed(code) => {
                        buffer.push(ThumbUpdate::Failed {
                            remote_path: item.remote_path.clone(),
                            code,
                        });
                    }
                    ItemOutcome::Skipped(reason) => {
                        buffer.push(ThumbUpdate::Skipped {
                            remote_path: item.remote_path.clone(),
                            reason,
                        });
                    }
                    ItemOutcome::Unreachable => {
                        unreachable = true;
                    }
                }
            }
            if unreachable {
                // Flush what already finished, then bail; the items not
                // yet written keep their state untouched.
                self.catalog.apply_thumb_updates(&buffer).await?;
                return Err(ThumbError::Unreachable);
            }

            let flush_for_first_success = fetched > 0 && !first_success_flushed;
            if flush_for_first_success
                || buffer.len() >= FLUSH_EVERY
                || last_flush.elapsed() >= FLUSH_STALENESS
            {
                self.catalog.apply_thumb_updates(&buffer).await?;
                buffer.clear();
                last_flush = Instant::now();
                if flush_for_first_success {
                    first_success_flushed = true;
                }
            }
        }
        self.catalog.apply_thumb_updates(&buffer).await?;

        let counts = self.catalog.thumb_counts(MAX_THUMB_RETRIES).await?;
        let dominant_error = self.catalog.dominant_thumb_error(MAX_THUMB_RETRIES).await?;
        Ok(BackfillOutcome {
            fetched,
            pending: counts.pending,
            exhausted: counts.exhausted,
            follow_up: counts.pending > 0 && !cancel.is_stopped(),
            dominant_error,
        })
    }

    async fn acquire_one(&self, item: &MediaItemRecord) -> ItemOutcome {
        let target = thumbnail_path_for(&self.thumb_root, &item.remote_path);
        // Self-healing cache hit: the file may already exist even when
        // the catalog lost track of it.
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return ItemOutcome::Ready(target.to_string_lossy().into_owned());
        }

        match self.client.fetch_preview(&item.remote_path, THUMB_SIZE).await {
            Ok(bytes) => match self.persist(&target, &bytes).await {
                Ok(path) => ItemOutcome::Ready(path),
                Err(err) => {
                    tracing::warn!(path = item.remote_path, "failed to persist thumbnail: {err}");
                    ItemOutcome::Failed("io".to_string())
                }
            },
            Err(err) if err.is_unreachable() => ItemOutcome::Unreachable,
            Err(err) if err.class() == ErrorClass::Unsupported => {
                if item.mime_type.starts_with("video/") {
                    self.extract_video_frame(item, &target).await
                } else {
                    self.transcode_image(item, &target).await
                }
            }
            Err(err) => {
                tracing::debug!(path = item.remote_path, code = %err.code(), "preview fetch failed");
                ItemOutcome::Failed(err.code())
            }
        }
    }

    /// Streams the remote video and decodes a single frame locally.
    /// Codecs the decoder cannot handle are a permanent, expected
    /// limitation and mark the item Skipped.
    async fn extract_video_frame(&self, item: &MediaItemRecord, target: &PathBuf) -> ItemOutcome {
        let bytes = match self.client.get_bytes(&item.remote_path).await {
            Ok(bytes) => bytes,
            Err(err) => return fetch_failure(&err),
        };
        match decode_thumbnail(&bytes) {
            Ok(jpeg) => match self.persist(target, &jpeg).await {
                Ok(path) => ItemOutcome::Ready(path),
                Err(_) => ItemOutcome::Failed("io".to_string()),
            },
            Err(_) => ItemOutcome::Skipped("codec_unsupported".to_string()),
        }
    }

    /// Fetches the original image and scales it down locally, with a
    /// bounded decode so oversized originals cannot exhaust memory.
    async fn transcode_image(&self, item: &MediaItemRecord, target: &PathBuf) -> ItemOutcome {
        let bytes = match self.client.get_bytes(&item.remote_path).await {
            Ok(bytes) => bytes,
            Err(err) => return fetch_failure(&err),
        };
        match decode_thumbnail(&bytes) {
            Ok(jpeg) => match self.persist(target, &jpeg).await {
                Ok(path) => ItemOutcome::Ready(path),
                Err(_) => ItemOutcome::Failed("io".to_string()),
            },
            Err(err) => {
                tracing::debug!(path = item.remote_path, "local decode failed: {err}");
                ItemOutcome::Failed("decode".to_string())
            }
        }
    }

    /// Partial-file-then-rename so a crash never leaves a torn
    /// thumbnail behind a Ready row.
    async fn persist(&self, target: &PathBuf, bytes: &[u8]) -> std::io::Result<String> {
        let mut partial = target.clone();
        partial.set_extension("part");
        tokio::fs::write(&partial, bytes).await?;
        tokio::fs::rename(&partial, target).await?;
        Ok(target.to_string_lossy().into_owned())
    }
}

fn fetch_failure(err: &WebdavError) -> ItemOutcome {
    if err.is_unreachable() {
        ItemOutcome::Unreachable
    } else {
        ItemOutcome::Failed(err.code())
    }
}

fn decode_thumbnail(bytes: &[u8]) -> Result<Vec<u8>, image::ImageError> {
    let mut limits = image::Limits::default();
    limits.max_image_width = Some(MAX_DECODE_EDGE);
    limits.max_image_height = Some(MAX_DECODE_EDGE);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);

    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.limits(limits);
    let decoded = reader.decode()?;
    let thumb = decoded.thumbnail(THUMB_SIZE, THUMB_SIZE);

    let mut out = Vec::new();
    thumb
        .to_rgb8()
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)?;
    Ok(out)
}
