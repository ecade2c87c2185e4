use photodav_core::{ErrorClass, WebdavClient};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> WebdavClient {
    WebdavClient::with_endpoints(
        &format!("{}/dav", server.uri()),
        &format!("{}/preview", server.uri()),
        "anna",
        "app-password",
    )
    .unwrap()
}

const MULTISTATUS: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:response>
    <d:href>/dav/Photos/</d:href>
    <d:propstat>
      <d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/Photos/a.jpg</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>5</d:getcontentlength>
        <d:getcontenttype>image/jpeg</d:getcontenttype>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:00 GMT</d:getlastmodified>
        <d:getetag>"e1"</d:getetag>
        <oc:fileid>17</oc:fileid>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

#[tokio::test]
async fn list_folder_sends_depth_one_and_parses_entries() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/Photos"))
        .and(header("Depth", "1"))
        .respond_with(ResponseTemplate::new(207).set_body_string(MULTISTATUS))
        .mount(&server)
        .await;

    let entries = client_for(&server).list_folder("/Photos").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].path, "/Photos/a.jpg");
    assert_eq!(entries[1].byte_size, Some(5));
    assert_eq!(entries[1].file_id.as_deref(), Some("17"));
}

#[tokio::test]
async fn list_recursive_sends_depth_infinity() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/Photos"))
        .and(header("Depth", "infinity"))
        .respond_with(ResponseTemplate::new(207).set_body_string(MULTISTATUS))
        .mount(&server)
        .await;

    let entries = client_for(&server).list_recursive("/Photos").await.unwrap();
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn propfind_on_missing_folder_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("PROPFIND"))
        .and(path("/dav/Gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = client_for(&server).list_folder("/Gone").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFound);
    assert_eq!(err.code(), "http_404");
}

#[tokio::test]
async fn head_reports_size_and_existence() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/dav/Photos/a.jpg"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-length", "1024")
                .insert_header("etag", "\"e9\""),
        )
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path("/dav/Photos/missing.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let present = client.head("/Photos/a.jpg").await.unwrap();
    assert!(present.exists);
    assert_eq!(present.byte_size, Some(1024));
    assert_eq!(present.etag.as_deref(), Some("e9"));

    let absent = client.head("/Photos/missing.jpg").await.unwrap();
    assert!(!absent.exists);
    assert_eq!(absent.byte_size, None);
}

#[tokio::test]
async fn put_streams_body_with_content_type() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/dav/Photos/new.jpg"))
        .and(header("content-type", "image/jpeg"))
        .and(wiremock::matchers::body_bytes(b"payload"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    client_for(&server)
        .put(
            "/Photos/new.jpg",
            reqwest::Body::from(&b"payload"[..]),
            "image/jpeg",
            7,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn delete_treats_already_gone_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/dav/Photos/old.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    client_for(&server).delete("/Photos/old.jpg").await.unwrap();
}

#[tokio::test]
async fn ensure_folder_creates_each_segment() {
    let server = MockServer::start().await;
    Mock::given(method("MKCOL"))
        .and(path("/dav/Backups"))
        .respond_with(ResponseTemplate::new(405))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("MKCOL"))
        .and(path("/dav/Backups/Camera"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    client_for(&server)
        .ensure_folder("/Backups/Camera")
        .await
        .unwrap();
}

#[tokio::test]
async fn fetch_preview_passes_size_and_returns_bytes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/preview"))
        .and(query_param("file", "/Photos/a.jpg"))
        .and(query_param("x", "256"))
        .and(query_param("y", "256"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegdata"))
        .mount(&server)
        .await;

    let bytes = client_for(&server)
        .fetch_preview("/Photos/a.jpg", 256)
        .await
        .unwrap();
    assert_eq!(bytes, b"jpegdata");
}

#[tokio::test]
async fn preview_of_unsupported_format_is_classified() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/preview"))
        .respond_with(ResponseTemplate::new(415))
        .mount(&server)
        .await;

    let err = client_for(&server)
        .fetch_preview("/Photos/clip.mkv", 256)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Unsupported);
}

#[tokio::test]
async fn unreachable_host_is_flagged_for_the_circuit_breaker() {
    // Nothing listens on this port; connect fails immediately.
    let client = WebdavClient::with_endpoints(
        "http://127.0.0.1:9/dav",
        "http://127.0.0.1:9/preview",
        "anna",
        "pw",
    )
    .unwrap();
    let err = client.head("/Photos/a.jpg").await.unwrap_err();
    assert!(err.is_unreachable());
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(err.code(), "unreachable");
}
