use quick_xml::Reader;
use quick_xml::events::Event;
use time::format_description::well_known::Rfc3339;

use crate::client::WebdavError;

/// One resource parsed out of a PROPFIND multistatus response.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Decoded path relative to the DAV root, always with a leading slash.
    pub path: String,
    pub is_collection: bool,
    pub byte_size: Option<u64>,
    /// `getlastmodified`, as a unix timestamp.
    pub last_modified: Option<i64>,
    /// `creationdate`, as a unix timestamp. Servers that index media
    /// expose the capture time here; absent for most plain files.
    pub created: Option<i64>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    /// Server-assigned stable file id, more durable than the path.
    pub file_id: Option<String>,
}

impl RemoteEntry {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(self.path.as_str())
    }
}

/// Properties from one `propstat` block. Only blocks whose status is
/// 200 contribute to the entry; 404 blocks enumerate absent properties.
#[derive(Default)]
struct PendingProps {
    is_collection: bool,
    byte_size: Option<u64>,
    last_modified: Option<i64>,
    created: Option<i64>,
    etag: Option<String>,
    content_type: Option<String>,
    file_id: Option<String>,
    status_ok: bool,
}

impl PendingProps {
    fn merge(&mut self, staged: PendingProps) {
        self.is_collection |= staged.is_collection;
        self.byte_size = staged.byte_size.or(self.byte_size);
        self.last_modified = staged.last_modified.or(self.last_modified);
        self.created = staged.created.or(self.created);
        self.etag = staged.etag.or(self.etag.take());
        self.content_type = staged.content_type.or(self.content_type.take());
        self.file_id = staged.file_id.or(self.file_id.take());
    }
}

#[derive(Default)]
struct PendingEntry {
    href: Option<String>,
    props: PendingProps,
    staged: PendingProps,
}

/// Parses a `207 Multi-Status` body into entries. Properties are matched
/// by local name so any namespace prefix (`D:`, `d:`, `oc:`) works.
pub fn parse_multistatus(xml: &str, dav_root: &str) -> Result<Vec<RemoteEntry>, WebdavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<PendingEntry> = None;
    let mut element_stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let local = local_name(start.name().as_ref());
                if local == "response" {
                    current = Some(PendingEntry::default());
                }
                element_stack.push(local);
            }
            Ok(Event::Empty(empty)) => {
                let local = local_name(empty.name().as_ref());
                if local == "collection"
                    && let Some(entry) = current.as_mut()
                {
                    entry.staged.is_collection = true;
                }
            }
            Ok(Event::Text(text)) => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                let Some(element) = element_stack.last() else {
                    continue;
                };
                let value = text
                    .unescape()
                    .map_err(|err| WebdavError::Multistatus(err.to_string()))?
                    .into_owned();
                match element.as_str() {
                    "href" => entry.href = Some(value),
                    "getcontentlength" => entry.staged.byte_size = value.trim().parse().ok(),
                    "getlastmodified" => {
                        entry.staged.last_modified = parse_http_date(value.trim());
                    }
                    "creationdate" => {
                        entry.staged.created = parse_rfc3339(value.trim());
                    }
                    "getetag" => entry.staged.etag = Some(value.trim_matches('"').to_string()),
                    "getcontenttype" => entry.staged.content_type = Some(value),
                    "fileid" => entry.staged.file_id = Some(value),
                    "status" => {
                        if value.contains("200") {
                            entry.staged.status_ok = true;
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                let local = local_name(end.name().as_ref());
                element_stack.pop();
                if local == "propstat"
                    && let Some(entry) = current.as_mut()
                {
                    let staged = std::mem::take(&mut entry.staged);
                    if staged.status_ok {
                        entry.props.merge(staged);
                    }
                }
                if local == "response"
                    && let Some(entry) = current.take()
                    && let Some(href) = entry.href.as_deref()
                {
                    let props = entry.props;
                    entries.push(RemoteEntry {
                        path: href_to_path(href, dav_root),
                        is_collection: props.is_collection,
                        byte_size: props.byte_size,
                        last_modified: props.last_modified,
                        created: props.created,
                        etag: props.etag,
                        content_type: props.content_type,
                        file_id: props.file_id,
                    });
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(WebdavError::Multistatus(err.to_string())),
        }
    }

    Ok(entries)
}

fn local_name(qualified: &[u8]) -> String {
    let name = qualified
        .rsplit(|byte| *byte == b':')
        .next()
        .unwrap_or(qualified);
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

/// Maps a multistatus href (absolute URL or absolute path, percent
/// encoded) to a decoded path relative to the DAV root.
fn href_to_path(href: &str, dav_root: &str) -> String {
    let path = href
        .strip_prefix(dav_root)
        .or_else(|| {
            // Some servers return the full URL in href; strip the origin
            // first, then the root's path component.
            let after_scheme = href.split_once("://").map(|(_, rest)| rest)?;
            let absolute = after_scheme.find('/').map(|i| &after_scheme[i..])?;
            absolute.strip_prefix(dav_root).or(Some(absolute))
        })
        .unwrap_or(href);
    let decoded = urlencoding::decode(path)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| path.to_string());
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn parse_http_date(value: &str) -> Option<i64> {
    let time = httpdate::parse_http_date(value).ok()?;
    time.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs() as i64)
}

fn parse_rfc3339(value: &str) -> Option<i64> {
    // Servers emit 1970-01-01T00:00:00Z when they track no creation time.
    let parsed = time::OffsetDateTime::parse(value, &Rfc3339).ok()?;
    let stamp = parsed.unix_timestamp();
    (stamp != 0).then_some(stamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/dav/files/anna/Photos/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/files/anna/Photos/summer%20trip/beach.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>2048</d:getcontentlength>
        <d:getcontenttype>image/jpeg</d:getcontenttype>
        <d:getlastmodified>Mon, 01 Jan 2024 12:00:00 GMT</d:getlastmodified>
        <d:creationdate>2023-07-14T10:30:00Z</d:creationdate>
        <d:getetag>"abc123"</d:getetag>
        <oc:fileid>00042</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn parses_files_and_collections() {
        let entries = parse_multistatus(SAMPLE, "/dav/files/anna").unwrap();
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].path, "/Photos");
        assert!(entries[0].is_collection);

        let file = &entries[1];
        assert_eq!(file.path, "/Photos/summer trip/beach.jpg");
        assert!(!file.is_collection);
        assert_eq!(file.byte_size, Some(2048));
        assert_eq!(file.content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(file.etag.as_deref(), Some("abc123"));
        assert_eq!(file.file_id.as_deref(), Some("00042"));
        assert_eq!(file.last_modified, Some(1_704_110_400));
        assert_eq!(file.created, Some(1_689_330_600));
        assert_eq!(file.file_name(), "beach.jpg");
    }

    #[test]
    fn strips_full_url_hrefs() {
        let xml = SAMPLE.replace("/dav/files/anna", "https://cloud.example.org/dav/files/anna");
        let entries = parse_multistatus(&xml, "/dav/files/anna").unwrap();
        assert_eq!(entries[1].path, "/Photos/summer trip/beach.jpg");
    }

    #[test]
    fn epoch_creationdate_is_treated_as_absent() {
        let xml = SAMPLE.replace("2023-07-14T10:30:00Z", "1970-01-01T00:00:00Z");
        let entries = parse_multistatus(&xml, "/dav/files/anna").unwrap();
        assert_eq!(entries[1].created, None);
    }

    #[test]
    fn entities_in_hrefs_are_resolved() {
        let xml = SAMPLE.replace("beach.jpg", "sand&amp;surf.jpg");
        let entries = parse_multistatus(&xml, "/dav/files/anna").unwrap();
        assert_eq!(entries[1].path, "/Photos/summer trip/sand&surf.jpg");
    }

    #[test]
    fn properties_from_failed_propstat_blocks_are_ignored() {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/files/anna/Photos/x.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>2048</d:getcontentlength>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
    <d:propstat>
      <d:prop><d:getcontenttype>bogus/value</d:getcontenttype></d:prop>
      <d:status>HTTP/1.1 404 Not Found</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;
        let entries = parse_multistatus(xml, "/dav/files/anna").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].byte_size, Some(2048));
        assert_eq!(entries[0].content_type, None);
    }

    #[test]
    fn malformed_xml_is_rejected() {
        let err = parse_multistatus("<d:multistatus><unclosed", "/dav").unwrap_err();
        assert!(matches!(err, WebdavError::Multistatus(_)));
    }
}
