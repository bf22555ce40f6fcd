use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use kinvey_client::{CancellationToken, Error, FileMetadata, Kinvey, TransferPhase, TransferState};
use kinvey_store::{Credential, MemoryCredentialStore, MemoryOfflineStore, OfflineStore};

// Deterministic payload with position-dependent bytes, so any offset mixup
// shows up as a content mismatch
fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn transfer_client(server: &MockServer, offline: Arc<MemoryOfflineStore>) -> Kinvey {
    let credential = Credential::new("u1", "tok-1");
    Kinvey::builder("kid_test", "secret")
        .base_url(server.uri())
        .chunk_size(400)
        .retry(2, Duration::from_millis(10))
        .credential_store(Arc::new(MemoryCredentialStore::with_credential(credential)))
        .offline_store(offline)
        .build()
        .unwrap()
}

fn file_metadata(id: &str) -> FileMetadata {
    FileMetadata {
        id: Some(id.to_string()),
        filename: Some("data.bin".to_string()),
        ..Default::default()
    }
}

async fn checkpoint(offline: &MemoryOfflineStore, id: &str) -> Option<TransferState> {
    offline
        .get("_transfers", id)
        .await
        .unwrap()
        .map(|record| serde_json::from_value(record).unwrap())
}

fn content_ranges(requests: &[Request], url_path: &str) -> Vec<String> {
    requests
        .iter()
        .filter(|request| request.url.path() == url_path)
        .map(|request| {
            request
                .headers
                .get("Content-Range")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

/// Mount a metadata endpoint answering with a fresh content URL on each call
async fn mount_upload_metadata(server: &MockServer, file_id: &str, size: usize, expected: u64) {
    let base = server.uri();
    let file_id_owned = file_id.to_string();
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("PUT"))
        .and(path(format!("/blob/kid_test/{file_id}")))
        .respond_with(move |_request: &Request| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_id": file_id_owned,
                "_filename": "data.bin",
                "size": size,
                "_uploadURL": format!("{base}/upload/{file_id_owned}/{}", call + 1),
                "_requiredHeaders": {"x-goog-meta-owner": "u1"}
            }))
        })
        .expect(expected)
        .mount(server)
        .await;
}

async fn mount_download_metadata(server: &MockServer, file_id: &str, size: usize, expected: u64) {
    let base = server.uri();
    let file_id_owned = file_id.to_string();
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("GET"))
        .and(path(format!("/blob/kid_test/{file_id}")))
        .respond_with(move |_request: &Request| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "_id": file_id_owned,
                "_filename": "data.bin",
                "size": size,
                "_downloadURL": format!("{base}/download/{file_id_owned}/{}", call + 1)
            }))
        })
        .expect(expected)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_upload_sends_sequential_chunks_until_confirmed() {
    let server = MockServer::start().await;
    mount_upload_metadata(&server, "f0", 1000, 1).await;
    Mock::given(method("PUT"))
        .and(path("/upload/f0/1"))
        .and(header("Content-Range", "bytes 0-399/1000"))
        .and(header("x-goog-meta-owner", "u1"))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-399"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/f0/1"))
        .and(header("Content-Range", "bytes 400-799/1000"))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-799"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/f0/1"))
        .and(header("Content-Range", "bytes 800-999/1000"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());

    let stored = client
        .file_store()
        .upload_bytes(Bytes::from(payload(1000)), file_metadata("f0"))
        .await
        .unwrap();

    assert_eq!(stored.id.as_deref(), Some("f0"));
    assert!(stored.upload_url.is_none());

    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        content_ranges(&requests, "/upload/f0/1"),
        vec![
            "bytes 0-399/1000",
            "bytes 400-799/1000",
            "bytes 800-999/1000"
        ]
    );
    // A finished upload leaves no checkpoint behind
    assert!(checkpoint(&offline, "f0").await.is_none());
}

#[tokio::test]
async fn test_aborted_upload_resumes_from_confirmed_bytes() {
    let server = MockServer::start().await;
    mount_upload_metadata(&server, "f1", 1000, 2).await;

    // First run confirms one chunk, then the backing store goes away
    Mock::given(method("PUT"))
        .and(path("/upload/f1/1"))
        .and(header("Content-Range", "bytes 0-399/1000"))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-399"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/f1/1"))
        .and(header("Content-Range", "bytes 400-799/1000"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // Second run gets a fresh session URL and a healthy store
    Mock::given(method("PUT"))
        .and(path("/upload/f1/2"))
        .and(header("Content-Range", "bytes 400-799/1000"))
        .respond_with(ResponseTemplate::new(308).insert_header("Range", "bytes=0-799"))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/f1/2"))
        .and(header("Content-Range", "bytes 800-999/1000"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());
    let data = Bytes::from(payload(1000));

    let error = client
        .file_store()
        .upload_bytes(data.clone(), file_metadata("f1"))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TransferAborted { .. }));

    // The abort left a resumable checkpoint at the confirmed boundary
    let state = checkpoint(&offline, "f1").await.unwrap();
    assert_eq!(state.bytes_confirmed, 400);
    assert_eq!(state.offset, 400);
    assert_eq!(state.phase, TransferPhase::InProgress);

    client
        .file_store()
        .upload_bytes(data, file_metadata("f1"))
        .await
        .unwrap();

    // The second run never re-sent already confirmed bytes
    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        content_ranges(&requests, "/upload/f1/2"),
        vec!["bytes 400-799/1000", "bytes 800-999/1000"]
    );
    assert!(checkpoint(&offline, "f1").await.is_none());
}

#[tokio::test]
async fn test_upload_standing_still_exhausts_the_attempt_budget() {
    let server = MockServer::start().await;
    mount_upload_metadata(&server, "f5", 1000, 1).await;
    // Acknowledgments without a Range header confirm nothing
    Mock::given(method("PUT"))
        .and(path("/upload/f5/1"))
        .respond_with(ResponseTemplate::new(308))
        .expect(2)
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());

    let error = client
        .file_store()
        .upload_bytes(Bytes::from(payload(1000)), file_metadata("f5"))
        .await
        .unwrap_err();

    match error {
        Error::TransferAborted { reason, .. } => assert!(reason.contains("no upload progress")),
        other => panic!("expected TransferAborted, got {other:?}"),
    }
    let requests = server.received_requests().await.unwrap();
    assert_eq!(
        content_ranges(&requests, "/upload/f5/1"),
        vec!["bytes 0-399/1000", "bytes 0-399/1000"]
    );
}

#[tokio::test]
async fn test_cancelled_upload_stops_before_any_chunk() {
    let server = MockServer::start().await;
    mount_upload_metadata(&server, "f6", 1000, 1).await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = client
        .file_store()
        .with_cancellation(cancel)
        .upload_bytes(Bytes::from(payload(1000)), file_metadata("f6"))
        .await
        .unwrap_err();

    match error {
        Error::TransferAborted { reason, .. } => assert_eq!(reason, "cancelled"),
        other => panic!("expected TransferAborted, got {other:?}"),
    }

    // No content bytes moved, and cancellation is not resumable
    let requests = server.received_requests().await.unwrap();
    assert!(requests
        .iter()
        .all(|request| !request.url.path().starts_with("/upload")));
    assert!(checkpoint(&offline, "f6").await.is_none());
}

#[tokio::test]
async fn test_download_resumes_across_partial_responses() {
    let server = MockServer::start().await;
    mount_download_metadata(&server, "f2", 900, 1).await;

    let data = payload(900);
    let data_clone = data.clone();
    Mock::given(method("GET"))
        .and(path("/download/f2/1"))
        .respond_with(move |request: &Request| {
            match request
                .headers
                .get("Range")
                .and_then(|value| value.to_str().ok())
            {
                // The connection drops after the first half
                None => ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-449/900")
                    .set_body_bytes(data_clone[..450].to_vec()),
                Some("bytes=450-") => ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 450-899/900")
                    .set_body_bytes(data_clone[450..].to_vec()),
                Some(other) => {
                    ResponseTemplate::new(500).set_body_string(format!("unexpected range {other}"))
                }
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("data.bin");

    client
        .file_store()
        .download_to_path("f2", &destination)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&destination).await.unwrap(), data);
    assert!(checkpoint(&offline, "f2").await.is_none());
}

#[tokio::test]
async fn test_aborted_download_resumes_in_a_later_run() {
    let server = MockServer::start().await;
    mount_download_metadata(&server, "f3", 900, 2).await;

    let data = payload(900);
    let data_clone = data.clone();
    // First run serves 300 bytes, then refuses every resume
    Mock::given(method("GET"))
        .and(path("/download/f3/1"))
        .respond_with(move |request: &Request| {
            if request.headers.get("Range").is_none() {
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-299/900")
                    .set_body_bytes(data_clone[..300].to_vec())
            } else {
                ResponseTemplate::new(503)
            }
        })
        .mount(&server)
        .await;
    // Second run only ever sees the resume request
    let data_clone = data.clone();
    Mock::given(method("GET"))
        .and(path("/download/f3/2"))
        .and(header("Range", "bytes=300-"))
        .respond_with(move |_request: &Request| {
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 300-899/900")
                .set_body_bytes(data_clone[300..].to_vec())
        })
        .expect(1)
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("data.bin");

    let error = client
        .file_store()
        .download_to_path("f3", &destination)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TransferAborted { .. }));

    let state = checkpoint(&offline, "f3").await.unwrap();
    assert_eq!(state.bytes_confirmed, 300);
    assert_eq!(state.phase, TransferPhase::InProgress);

    client
        .file_store()
        .download_to_path("f3", &destination)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&destination).await.unwrap(), data);
    assert!(checkpoint(&offline, "f3").await.is_none());
}

#[tokio::test]
async fn test_download_restarts_when_resume_is_not_honored() {
    let server = MockServer::start().await;
    mount_download_metadata(&server, "f4", 500, 2).await;

    let data = payload(500);
    let data_clone = data.clone();
    Mock::given(method("GET"))
        .and(path("/download/f4/1"))
        .respond_with(move |request: &Request| {
            if request.headers.get("Range").is_none() {
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "bytes 0-249/500")
                    .set_body_bytes(data_clone[..250].to_vec())
            } else {
                ResponseTemplate::new(503)
            }
        })
        .mount(&server)
        .await;
    // The second origin ignores ranges and always replays the whole payload
    let data_clone = data.clone();
    Mock::given(method("GET"))
        .and(path("/download/f4/2"))
        .respond_with(move |_request: &Request| {
            ResponseTemplate::new(200).set_body_bytes(data_clone.clone())
        })
        .expect(1)
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("data.bin");

    let error = client
        .file_store()
        .download_to_path("f4", &destination)
        .await
        .unwrap_err();
    assert!(matches!(error, Error::TransferAborted { .. }));
    assert_eq!(checkpoint(&offline, "f4").await.unwrap().bytes_confirmed, 250);

    client
        .file_store()
        .download_to_path("f4", &destination)
        .await
        .unwrap();

    // The stale partial content was truncated, not appended to
    assert_eq!(tokio::fs::read(&destination).await.unwrap(), data);
}

#[tokio::test]
async fn test_upload_from_local_file() {
    let server = MockServer::start().await;
    let data = payload(600);
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("report.bin");
    tokio::fs::write(&source, &data).await.unwrap();

    mount_upload_metadata(&server, "f7", 600, 1).await;
    let received = Arc::new(std::sync::Mutex::new(Vec::<u8>::new()));
    let received_clone = received.clone();
    Mock::given(method("PUT"))
        .and(path("/upload/f7/1"))
        .respond_with(move |request: &Request| {
            let total = {
                let mut buffer = received_clone.lock().unwrap();
                buffer.extend_from_slice(&request.body);
                buffer.len()
            };
            if total >= 600 {
                ResponseTemplate::new(200)
            } else {
                ResponseTemplate::new(308)
                    .insert_header("Range", format!("bytes=0-{}", total - 1).as_str())
            }
        })
        .mount(&server)
        .await;

    let offline = Arc::new(MemoryOfflineStore::new());
    let client = transfer_client(&server, offline.clone());

    let stored = client
        .file_store()
        .upload_file(&source, FileMetadata {
            id: Some("f7".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(stored.size, Some(600));
    assert_eq!(*received.lock().unwrap(), data);
}
