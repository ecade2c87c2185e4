use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed session file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG config directory is unavailable")]
    MissingConfigDir,
}

/// Credentials for the remote store. `app_password` is an app-specific
/// password, never the account password.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub server_url: String,
    pub login_name: String,
    pub app_password: String,
}

/// Resolves the active session from the environment first, then from
/// the JSON file a previous login wrote.
pub struct SessionStore {
    file_path: PathBuf,
}

impl SessionStore {
    pub fn new(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub fn default_path() -> Result<PathBuf, SessionError> {
        let mut path = dirs::config_dir().ok_or(SessionError::MissingConfigDir)?;
        path.push("photodav");
        path.push("session.json");
        Ok(path)
    }

    pub fn open_default() -> Result<Self, SessionError> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn active_session(&self) -> Result<Option<Session>, SessionError> {
        if let Some(session) = session_from_env() {
            return Ok(Some(session));
        }
        match fs::read(&self.file_path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn store(&self, session: &Session) -> Result<(), SessionError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(session)?;
        fs::write(&self.file_path, bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.file_path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.file_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn session_from_env() -> Option<Session> {
    let server_url = std::env::var("PHOTODAV_SERVER_URL").ok()?;
    let login_name = std::env::var("PHOTODAV_LOGIN").ok()?;
    let app_password = std::env::var("PHOTODAV_PASSWORD").ok()?;
    Some(Session {
        server_url,
        login_name,
        app_password,
    })
}
