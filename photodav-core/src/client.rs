use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::multistatus::{RemoteEntry, parse_multistatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const READ_TIMEOUT: Duration = Duration::from_secs(120);

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:resourcetype/>
    <d:getcontentlength/>
    <d:getcontenttype/>
    <d:getlastmodified/>
    <d:creationdate/>
    <d:getetag/>
    <oc:fileid/>
  </d:prop>
</d:propfind>"#;

#[derive(Debug, Error)]
pub enum WebdavError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("multistatus parse error: {0}")]
    Multistatus(String),
}

/// Coarse failure classification; every transport error maps onto
/// exactly one class so callers never inspect status codes themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// DNS/connect failure, timeout, 429 or 5xx. Eligible for retry.
    Transient,
    /// 401/403-class; a credential problem, not retried here.
    Auth,
    /// 404/410 on a known resource; an authoritative deletion signal.
    NotFound,
    /// 409/412; never auto-resolved.
    Conflict,
    /// Certificate/TLS validation failure; terminal, surfaced prominently.
    Security,
    /// 415/501-class; the server cannot render this format.
    Unsupported,
    /// Anything else; terminal.
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }
}

impl WebdavError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WebdavError::Request(err) => {
                if is_certificate_error(err) {
                    ErrorClass::Security
                } else if err.is_connect() || err.is_timeout() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Permanent
                }
            }
            WebdavError::Status { status, .. } => classify_status(*status),
            WebdavError::Url(_) | WebdavError::Multistatus(_) => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class().is_transient()
    }

    /// True for DNS/connect-level failures: nothing host-specific went
    /// wrong, the host simply cannot be reached at all.
    pub fn is_unreachable(&self) -> bool {
        match self {
            WebdavError::Request(err) => err.is_connect() && !is_certificate_error(err),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            WebdavError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short stable code for checkpoints and queue rows.
    pub fn code(&self) -> String {
        match self {
            WebdavError::Request(err) => {
                if self.is_unreachable() {
                    "unreachable".to_string()
                } else if err.is_timeout() {
                    "timeout".to_string()
                } else if is_certificate_error(err) {
                    "tls".to_string()
                } else {
                    "request".to_string()
                }
            }
            WebdavError::Status { status, .. } => format!("http_{}", status.as_u16()),
            WebdavError::Url(_) => "url".to_string(),
            WebdavError::Multistatus(_) => "multistatus".to_string(),
        }
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorClass::Auth,
        StatusCode::NOT_FOUND | StatusCode::GONE => ErrorClass::NotFound,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => ErrorClass::Conflict,
        StatusCode::UNSUPPORTED_MEDIA_TYPE | StatusCode::NOT_IMPLEMENTED => ErrorClass::Unsupported,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ErrorClass::Transient,
        status if status.is_server_error() => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.contains("certificate") || text.contains("Certificate") {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Result of a single-file HEAD existence check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadInfo {
    pub exists: bool,
    pub byte_size: Option<u64>,
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct WebdavClient {
    http: Client,
    dav_url: Url,
    preview_url: Url,
    login: String,
    secret: String,
}

impl WebdavClient {
    /// Builds a client for a server base URL; the DAV file tree lives at
    /// `{server}/dav` and server-rendered previews at `{server}/preview`.
    pub fn new(
        server_url: &str,
        login: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, WebdavError> {
        let base = server_url.trim_end_matches('/');
        Self::with_endpoints(
            &format!("{base}/dav"),
            &format!("{base}/preview"),
            login,
            secret,
        )
    }

    pub fn with_endpoints(
        dav_url: &str,
        preview_url: &str,
        login: impl Into<String>,
        secret: impl Into<String>,
    ) -> Result<Self, WebdavError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            dav_url: Url::parse(dav_url.trim_end_matches('/'))?,
            preview_url: Url::parse(preview_url)?,
            login: login.into(),
            secret: secret.into(),
        })
    }

    /// Single-level listing of one folder.
    pub async fn list_folder(&self, folder: &str) -> Result<Vec<RemoteEntry>, WebdavError> {
        self.propfind(folder, "1").await
    }

    /// Recursive listing of a folder subtree. Servers may reject
    /// `Depth: infinity`; callers fall back to [`Self::list_folder`].
    pub async fn list_recursive(&self, folder: &str) -> Result<Vec<RemoteEntry>, WebdavError> {
        self.propfind(folder, "infinity").await
    }

    async fn propfind(&self, folder: &str, depth: &str) -> Result<Vec<RemoteEntry>, WebdavError> {
        let url = self.resource_url(folder)?;
        let response = self
            .http
            .request(Method::from_bytes(b"PROPFIND").expect("valid method"), url)
            .basic_auth(&self.login, Some(&self.secret))
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::MULTI_STATUS && !status.is_success() {
            return Err(status_error(response).await);
        }

        let body = response.text().await?;
        parse_multistatus(&body, self.dav_url.path())
    }

    /// Existence check for a single file. A 404 is a definitive "not
    /// there", not an error.
    pub async fn head(&self, path: &str) -> Result<HeadInfo, WebdavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .head(url)
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(HeadInfo {
                exists: false,
                byte_size: None,
                etag: None,
            });
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let byte_size = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string());
        Ok(HeadInfo {
            exists: true,
            byte_size,
            etag,
        })
    }

    /// Streams `body` to the remote path.
    pub async fn put(
        &self,
        path: &str,
        body: reqwest::Body,
        content_type: &str,
        length: u64,
    ) -> Result<(), WebdavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .put(url)
            .basic_auth(&self.login, Some(&self.secret))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }

    /// Deletes a remote resource; already-gone counts as success.
    pub async fn delete(&self, path: &str) -> Result<(), WebdavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .delete(url)
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            return Ok(());
        }
        Err(status_error(response).await)
    }

    /// Idempotent create-if-missing for a folder path, creating parents
    /// as needed. "Already exists" responses are success.
    pub async fn ensure_folder(&self, path: &str) -> Result<(), WebdavError> {
        let mut current = String::new();
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            current.push('/');
            current.push_str(segment);
            self.mkcol(&current).await?;
        }
        Ok(())
    }

    async fn mkcol(&self, path: &str) -> Result<(), WebdavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .request(Method::from_bytes(b"MKCOL").expect("valid method"), url)
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            // The collection (or a parent mid-walk) already exists.
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            _ => Err(status_error(response).await),
        }
    }

    /// Fetches a server-rendered preview scaled to fit `size` pixels.
    pub async fn fetch_preview(&self, path: &str, size: u32) -> Result<Vec<u8>, WebdavError> {
        let mut url = self.preview_url.clone();
        url.query_pairs_mut()
            .append_pair("file", path)
            .append_pair("x", &size.to_string())
            .append_pair("y", &size.to_string());
        let response = self
            .http
            .get(url)
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Downloads the raw file contents.
    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>, WebdavError> {
        let url = self.resource_url(path)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.login, Some(&self.secret))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn resource_url(&self, path: &str) -> Result<Url, WebdavError> {
        let suffix = path.trim_start_matches('/');
        Ok(Url::parse(&format!(
            "{}/{}",
            self.dav_url.as_str().trim_end_matches('/'),
            suffix
        ))?)
    }
}

async fn status_error(response: reqwest::Response) -> WebdavError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    WebdavError::Status { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_follows_the_taxonomy() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorClass::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorClass::Auth);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), ErrorClass::NotFound);
        assert_eq!(classify_status(StatusCode::CONFLICT), ErrorClass::Conflict);
        assert_eq!(
            classify_status(StatusCode::UNSUPPORTED_MEDIA_TYPE),
            ErrorClass::Unsupported
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_status(StatusCode::IM_A_TEAPOT),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn status_error_codes_are_stable() {
        let err = WebdavError::Status {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert_eq!(err.code(), "http_502");
        assert!(err.is_transient());
        assert!(!err.is_unreachable());
    }
}
