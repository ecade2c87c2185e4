use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use photodav_core::WebdavClient;

use crate::scheduler::{DedupPolicy, JobScheduler};
use crate::session::SessionStore;
use crate::sync::catalog::CatalogStore;
use crate::sync::detector::{BackupPolicy, ChangeDetector};
use crate::sync::indexer::RemoteIndexer;
use crate::sync::local_media::{FsMediaSource, MimeFilter, ScanScope};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::thumbs::ThumbnailService;
use crate::sync::uploader::UploadProcessor;

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub selected_folders: Vec<String>,
    pub backup_target: String,
    pub media_root: PathBuf,
    pub backup_scope: ScanScope,
    pub mime_filter: MimeFilter,
    pub mirror_deletes: bool,
    pub db_path: PathBuf,
    pub thumb_root: PathBuf,
    pub index_interval: Duration,
    pub detect_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let selected_folders = env_list("PHOTODAV_FOLDERS", "/Photos");
        let backup_target =
            env_or("PHOTODAV_BACKUP_TARGET", "/Backups/Camera");
        let media_root = match std::env::var("PHOTODAV_MEDIA_ROOT") {
            Ok(value) => PathBuf::from(value),
            Err(_) => dirs::picture_dir()
                .context("PHOTODAV_MEDIA_ROOT is unset and no XDG pictures directory exists")?,
        };
        let backup_scope = match std::env::var("PHOTODAV_BACKUP_SCOPE") {
            Ok(value) if !value.trim().is_empty() => ScanScope::Folders(
                value
                    .split(',')
                    .map(|folder| PathBuf::from(folder.trim()))
                    .collect(),
            ),
            _ => ScanScope::EntireLibrary,
        };
        let mime_filter = match env_or("PHOTODAV_MIME_FILTER", "all").as_str() {
            "all" => MimeFilter::All,
            "images" => MimeFilter::ImagesOnly,
            "videos" => MimeFilter::VideosOnly,
            other => bail!("unknown PHOTODAV_MIME_FILTER value: {other}"),
        };
        let mirror_deletes = env_or("PHOTODAV_MIRROR_DELETES", "false") == "true";
        let db_path = match std::env::var("PHOTODAV_DB") {
            Ok(value) => PathBuf::from(value),
            Err(_) => {
                let mut path = dirs::data_dir().context("no XDG data directory")?;
                path.push("photodav");
                path.push("catalog.db");
                path
            }
        };
        let thumb_root = match std::env::var("PHOTODAV_THUMBS") {
            Ok(value) => PathBuf::from(value),
            Err(_) => {
                let mut path = dirs::cache_dir().context("no XDG cache directory")?;
                path.push("photodav");
                path.push("thumbs");
                path
            }
        };
        Ok(Self {
            selected_folders,
            backup_target,
            media_root,
            backup_scope,
            mime_filter,
            mirror_deletes,
            db_path,
            thumb_root,
            index_interval: env_secs("PHOTODAV_INDEX_INTERVAL_SECS", 900),
            detect_interval: env_secs("PHOTODAV_DETECT_INTERVAL_SECS", 300),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env_or(name, default)
        .split(',')
        .map(str::trim)
        .filter(|folder| !folder.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_secs(name: &str, default: u64) -> Duration {
    let seconds = std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(seconds)
}

pub async fn run() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env()?;
    let sessions = SessionStore::open_default()?;
    let Some(session) = sessions.active_session()? else {
        bail!(
            "no active session: set PHOTODAV_SERVER_URL, PHOTODAV_LOGIN and \
             PHOTODAV_PASSWORD, or write the session file"
        );
    };

    tracing::info!(server = session.server_url, "starting photodav daemon");
    let client = Arc::new(WebdavClient::new(
        &session.server_url,
        &session.login_name,
        &session.app_password,
    )?);
    let catalog = CatalogStore::open(&config.db_path).await?;

    let indexer = RemoteIndexer::new(
        Arc::clone(&client),
        catalog.clone(),
        config.thumb_root.clone(),
    );
    let thumbs = ThumbnailService::new(
        Arc::clone(&client),
        catalog.clone(),
        config.thumb_root.clone(),
    );
    let detector = Arc::new(ChangeDetector::new(
        Arc::new(FsMediaSource::new(config.media_root.clone())),
        catalog.clone(),
        BackupPolicy {
            scope: config.backup_scope.clone(),
            mime_filter: config.mime_filter,
            target_folder: config.backup_target.clone(),
            mirror_deletes: config.mirror_deletes,
        },
    ));
    let uploader = Arc::new(UploadProcessor::new(Arc::clone(&client), catalog.clone()));

    let orchestrator = SyncOrchestrator::new(
        JobScheduler::new(),
        catalog,
        indexer,
        thumbs,
        detector,
        uploader,
        config.selected_folders.clone(),
    );

    orchestrator.request_combined_sync_now();

    // Periodic background kicks keep an already-running job rather than
    // replacing it.
    {
        let orchestrator = Arc::clone(&orchestrator);
        let interval = config.index_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.schedule_index(DedupPolicy::Keep);
            }
        });
    }
    {
        let orchestrator = Arc::clone(&orchestrator);
        let interval = config.detect_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.schedule_detect(false, DedupPolicy::Keep);
            }
        });
    }
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            let mut sync_rx = orchestrator.subscribe_sync();
            let mut backup_rx = orchestrator.subscribe_backup();
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = orchestrator.refresh().await {
                            tracing::error!("status refresh failed: {err}");
                        }
                    }
                    changed = sync_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::info!(status = ?*sync_rx.borrow_and_update(), "sync status");
                    }
                    changed = backup_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::info!(status = ?*backup_rx.borrow_and_update(), "backup status");
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    orchestrator.cancel_all();
    Ok(())
}
