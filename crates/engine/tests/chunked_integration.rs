//! End-to-end task tests against a local mock server: a range-capable
//! server drives the segmented path, a range-oblivious one falls back to a
//! single stream, and both must land byte-identical output.

use paradl_engine::{DownloadConfig, DownloadRequest, DownloadTask, TaskStatus};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn mount_ranged(server: &MockServer, content: &'static [u8]) {
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(move |_: &Request| {
            ResponseTemplate::new(206)
                .insert_header("content-length", content.len().to_string())
                .insert_header("content-range", format!("bytes 0-0/{}", content.len()))
        })
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(move |req: &Request| {
            let range = req
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("bytes="))
                .unwrap();
            let (start, end) = range.split_once('-').unwrap();
            let start: usize = start.parse().unwrap();
            let end: usize = end.parse().unwrap();
            let slice = content[start..=end].to_vec();
            ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes {start}-{end}/{}", content.len()))
                .set_body_bytes(slice)
        })
        .mount(server)
        .await;
}

async fn mount_unranged(server: &MockServer, content: &'static [u8]) {
    Mock::given(method("HEAD"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-length", content.len().to_string()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(server)
        .await;
}

#[tokio::test]
async fn segmented_download_reassembles_the_full_file() {
    let content: &'static [u8] = Box::leak(body(64 * 1024).into_boxed_slice());
    let server = MockServer::start().await;
    mount_ranged(&server, content).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = DownloadConfig::default();
    config.split = 4;
    config.segment_size = 4096;
    let request = DownloadRequest {
        urls: vec![format!("{}/file.bin", server.uri())],
        filename: Some("out.bin".to_string()),
        output_directory: Some(dir.path().to_path_buf()),
    };
    let task = DownloadTask::new(request, config);
    task.run().await.unwrap();

    let info = task.info();
    assert_eq!(info.status, TaskStatus::Completed);
    assert!(info.segments.len() > 1, "expected more than one segment");
    let written = tokio::fs::read(&info.output_path).await.unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn single_stream_download_is_used_when_ranges_are_unsupported() {
    let content: &'static [u8] = Box::leak(body(8192).into_boxed_slice());
    let server = MockServer::start().await;
    mount_unranged(&server, content).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = DownloadConfig::default();
    config.split = 8;
    config.segment_size = 1024;
    let request = DownloadRequest {
        urls: vec![format!("{}/file.bin", server.uri())],
        filename: Some("out.bin".to_string()),
        output_directory: Some(dir.path().to_path_buf()),
    };
    let task = DownloadTask::new(request, config);
    task.run().await.unwrap();

    let info = task.info();
    assert_eq!(info.status, TaskStatus::Completed);
    assert_eq!(info.segments.len(), 1);
    let written = tokio::fs::read(&info.output_path).await.unwrap();
    assert_eq!(written, content);
}

#[tokio::test]
async fn cancelling_a_running_download_leaves_it_in_the_cancelled_state() {
    let content: &'static [u8] = Box::leak(body(1024 * 1024).into_boxed_slice());
    let server = MockServer::start().await;
    mount_ranged(&server, content).await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = DownloadConfig::default();
    config.split = 2;
    config.segment_size = 4096;
    let request = DownloadRequest {
        urls: vec![format!("{}/file.bin", server.uri())],
        filename: Some("out.bin".to_string()),
        output_directory: Some(dir.path().to_path_buf()),
    };
    let task = DownloadTask::new(request, config);
    assert!(task.cancel());
    let result = task.run().await;
    assert!(matches!(result, Err(paradl_engine::EngineError::Cancelled)));
    assert!(matches!(task.info().status, TaskStatus::Cancelled));
}
