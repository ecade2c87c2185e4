use std::{
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum MediaSourceError {
    #[error("I/O error scanning {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

/// A locally-observed media item. `stable_key` identifies the content,
/// not the path, so moves and renames do not look like new items.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMediaItem {
    pub stable_key: String,
    pub local_uri: String,
    pub file_name: String,
    pub mime_type: String,
    pub byte_size: i64,
    pub capture_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanScope {
    EntireLibrary,
    Folders(Vec<PathBuf>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeFilter {
    All,
    ImagesOnly,
    VideosOnly,
}

impl MimeFilter {
    pub fn accepts(&self, mime_type: &str) -> bool {
        match self {
            MimeFilter::All => {
                mime_type.starts_with("image/") || mime_type.starts_with("video/")
            }
            MimeFilter::ImagesOnly => mime_type.starts_with("image/"),
            MimeFilter::VideosOnly => mime_type.starts_with("video/"),
        }
    }
}

pub trait MediaSource: Send + Sync {
    fn scan(
        &self,
        scope: &ScanScope,
        filter: MimeFilter,
    ) -> Result<Vec<LocalMediaItem>, MediaSourceError>;
}

/// Filesystem-backed media source rooted at the device's media
/// directory.
pub struct FsMediaSource {
    root: PathBuf,
}

impl FsMediaSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn scan_dir(
        &self,
        dir: &Path,
        filter: MimeFilter,
        out: &mut Vec<LocalMediaItem>,
    ) -> Result<(), MediaSourceError> {
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some(mime_type) = mime_for_path(path) else {
                continue;
            };
            if !filter.accepts(mime_type) {
                continue;
            }
            let metadata = entry.metadata()?;
            let stable_key = content_key(path).map_err(|source| MediaSourceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            out.push(LocalMediaItem {
                stable_key,
                local_uri: path.to_string_lossy().into_owned(),
                file_name,
                mime_type: mime_type.to_string(),
                byte_size: metadata.len() as i64,
                capture_ts: capture_timestamp(path, mime_type),
            });
        }
        Ok(())
    }
}

impl MediaSource for FsMediaSource {
    fn scan(
        &self,
        scope: &ScanScope,
        filter: MimeFilter,
    ) -> Result<Vec<LocalMediaItem>, MediaSourceError> {
        let mut items = Vec::new();
        match scope {
            ScanScope::EntireLibrary => self.scan_dir(&self.root, filter, &mut items)?,
            ScanScope::Folders(folders) => {
                for folder in folders {
                    let dir = if folder.is_absolute() {
                        folder.clone()
                    } else {
                        self.root.join(folder)
                    };
                    if dir.is_dir() {
                        self.scan_dir(&dir, filter, &mut items)?;
                    }
                }
            }
        }
        items.sort_by(|a, b| a.local_uri.cmp(&b.local_uri));
        Ok(items)
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" | "heif" => "image/heic",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "3gp" => "video/3gpp",
        _ => return None,
    };
    Some(mime)
}

fn content_key(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut context = md5::Context::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// EXIF capture time for images, as a unix timestamp. Videos and files
/// without usable EXIF yield None; the queue carries that through.
fn capture_timestamp(path: &Path, mime_type: &str) -> Option<i64> {
    if !mime_type.starts_with("image/") {
        return None;
    }
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif
        .get_field(exif::Tag::DateTimeOriginal, exif::In::PRIMARY)
        .or_else(|| exif.get_field(exif::Tag::DateTime, exif::In::PRIMARY))?;
    let ascii = match field.value {
        exif::Value::Ascii(ref lines) if !lines.is_empty() => &lines[0],
        _ => return None,
    };
    let parsed = exif::DateTime::from_ascii(ascii).ok()?;
    exif_to_unix(&parsed)
}

/// EXIF timestamps carry no zone; treat them as UTC.
fn exif_to_unix(dt: &exif::DateTime) -> Option<i64> {
    let month = time::Month::try_from(dt.month).ok()?;
    let date = time::Date::from_calendar_date(i32::from(dt.year), month, dt.day).ok()?;
    let clock = time::Time::from_hms(dt.hour, dt.minute, dt.second).ok()?;
    Some(date.with_time(clock).assume_utc().unix_timestamp())
}
