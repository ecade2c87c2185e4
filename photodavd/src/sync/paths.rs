use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Normalizes a remote path to a leading-slash form without a trailing
/// slash; the catalog keys on this form.
pub fn normalize_remote_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Both accepted spellings of a folder prefix: with and without the
/// trailing slash. Pruning matches either alias.
pub fn folder_aliases(folder: &str) -> [String; 2] {
    let normalized = normalize_remote_path(folder);
    let with_slash = if normalized == "/" {
        normalized.clone()
    } else {
        format!("{normalized}/")
    };
    [normalized, with_slash]
}

/// True when `path` lives under `folder` (or is the folder itself).
pub fn is_under(folder: &str, path: &str) -> bool {
    let folder = normalize_remote_path(folder);
    let path = normalize_remote_path(path);
    if folder == "/" {
        return true;
    }
    path == folder || path.starts_with(&format!("{folder}/"))
}

pub fn folder_of(path: &str) -> String {
    let normalized = normalize_remote_path(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => normalized[..index].to_string(),
    }
}

pub fn join_remote(folder: &str, name: &str) -> String {
    let folder = normalize_remote_path(folder);
    if folder == "/" {
        format!("/{}", name.trim_start_matches('/'))
    } else {
        format!("{folder}/{}", name.trim_start_matches('/'))
    }
}

/// Deterministic thumbnail file name derived from the remote path, so a
/// lost database row can still find its file on disk.
pub fn thumbnail_file_name(remote_path: &str) -> String {
    let digest = Sha256::digest(normalize_remote_path(remote_path).as_bytes());
    format!("{digest:x}.jpg")
}

pub fn thumbnail_path_for(thumb_root: &Path, remote_path: &str) -> PathBuf {
    thumb_root.join(thumbnail_file_name(remote_path))
}
