//! Interrupted uploads resumed through the session table.

mod common;

use std::path::Path;
use std::time::Duration;

use common::{
    create_temp_dir, create_test_file, prepare_job, random_bytes, FlakyProxy, TestServer,
};
use ferry_core::audit::AuditAction;
use ferry_core::client::{TcpTransferClient, TransferClient, UploadJob, WithRetry};
use ferry_core::error::{Error, ErrorKind};
use ferry_core::protocol::{ChunkData, ChunkResult, TransferResponse};
use ferry_core::retry::{RetryCoordinator, RetryPolicy};
use ferry_core::server::ReceiverOptions;
use tokio_util::sync::CancellationToken;

const CHUNK: u64 = 4096;

/// Upload the first `sent` chunks of `job` by hand, then hang up.
///
/// Returns the resume token handed out by the receiver.
async fn interrupt_after(server: &TestServer, job: &UploadJob, sent: u64) -> String {
    let data = std::fs::read(&job.source).expect("read source");
    let mut raw = server.connect_raw().await;

    raw.send(&job.request()).await;
    let ack: TransferResponse = raw.recv().await;
    assert!(ack.success, "handshake rejected: {:?}", ack.error_message);
    assert_eq!(ack.completed_chunks().expect("completed chunks"), Vec::<u64>::new());
    let token = ack.resume_token.expect("resume token");

    for index in 0..sent {
        let (offset, len) = job.strategy.chunk_range(index, job.metadata.file_size);
        let bytes = data[offset as usize..(offset + len) as usize].to_vec();
        raw.send(&ChunkData::new(job.transfer_id, index, bytes, false))
            .await;
        let result: ChunkResult = raw.recv().await;
        assert!(result.success, "chunk {index} rejected");
    }

    drop(raw);
    match server.audit.wait_for_end(job.transfer_id).await {
        AuditAction::TransferFailed { .. } => {}
        other => panic!("interrupted transfer should fail, got {other:?}"),
    }
    token
}

fn sent_chunks(server: &TestServer, job: &UploadJob) -> Vec<u64> {
    server
        .audit
        .for_transfer(job.transfer_id)
        .into_iter()
        .filter_map(|a| match a {
            AuditAction::ChunkCompleted { chunk_index } => Some(chunk_index),
            _ => None,
        })
        .collect()
}

fn assert_same_content(received: &Path, source: &Path) {
    let received = std::fs::read(received).expect("read received");
    let source = std::fs::read(source).expect("read source");
    assert_eq!(received, source, "file contents differ");
}

#[tokio::test]
async fn test_resume_skips_completed_chunks() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let path = create_test_file(src.path(), "vm.img", &random_bytes(CHUNK as usize * 5));

    let first = prepare_job(&path, CHUNK).await;
    let token = interrupt_after(&server, &first, 2).await;

    let info = server.sessions.resume_info(&token).await.expect("resume info");
    assert_eq!(info.completed_chunks, vec![0, 1]);
    assert_eq!(info.chunk_count, 5);

    let second = prepare_job(&path, CHUNK).await.with_resume_token(token.clone());
    let outcome = server
        .client()
        .upload(&second, &CancellationToken::new())
        .await
        .expect("resumed upload");

    assert_eq!(outcome.chunks_skipped, 2);
    assert_eq!(outcome.chunks_sent, 3);
    assert_eq!(outcome.resume_token.as_deref(), Some(token.as_str()));
    assert_same_content(&server.client_dir().join("vm.img"), &path);
    assert!(server.partial_files().is_empty());

    server.audit.wait_for_end(second.transfer_id).await;
    assert!(matches!(
        server.audit.for_transfer(second.transfer_id).first(),
        Some(AuditAction::TransferStarted { resumed: true, .. })
    ));
    assert_eq!(sent_chunks(&server, &second), vec![2, 3, 4]);

    // A finalized session no longer answers to its token.
    assert!(matches!(
        server.sessions.resume_info(&token).await,
        Err(Error::SessionNotFound(_))
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_resume_after_receiver_restart() {
    let root = create_temp_dir();
    let src = create_temp_dir();
    let path = create_test_file(src.path(), "logs.tar", &random_bytes(CHUNK as usize * 4 + 9));

    let server = TestServer::start_at(root.path(), ReceiverOptions::default(), None).await;
    let first = prepare_job(&path, CHUNK).await;
    let token = interrupt_after(&server, &first, 3).await;
    server.stop().await;

    let server = TestServer::start_at(root.path(), ReceiverOptions::default(), None).await;
    let info = server.sessions.resume_info(&token).await.expect("reloaded session");
    assert_eq!(info.completed_chunks, vec![0, 1, 2]);

    let second = prepare_job(&path, CHUNK).await.with_resume_token(token);
    let outcome = server
        .client()
        .upload(&second, &CancellationToken::new())
        .await
        .expect("resumed upload");

    assert_eq!(outcome.chunks_skipped, 3);
    assert_eq!(outcome.chunks_sent, 2);
    assert_same_content(&server.client_dir().join("logs.tar"), &path);

    server.stop().await;
}

#[tokio::test]
async fn test_changed_content_starts_new_session() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let path = create_test_file(src.path(), "db.dump", &random_bytes(CHUNK as usize * 3));

    let first = prepare_job(&path, CHUNK).await;
    let token = interrupt_after(&server, &first, 1).await;

    // The source changed since the interrupted attempt.
    create_test_file(src.path(), "db.dump", &random_bytes(CHUNK as usize * 3));
    let second = prepare_job(&path, CHUNK).await.with_resume_token(token.clone());
    let outcome = server
        .client()
        .upload(&second, &CancellationToken::new())
        .await
        .expect("fallback upload");

    assert_eq!(outcome.chunks_skipped, 0);
    assert_eq!(outcome.chunks_sent, 3);
    assert_ne!(outcome.resume_token.as_deref(), Some(token.as_str()));
    assert_same_content(&server.client_dir().join("db.dump"), &path);

    // The stale session stays resumable until it expires.
    let stale = server.sessions.resume_info(&token).await.expect("stale session");
    assert_eq!(stale.completed_chunks, vec![0]);

    server.stop().await;
}

#[tokio::test]
async fn test_strict_resume_rejects_unknown_token() {
    let root = create_temp_dir();
    let options = ReceiverOptions {
        strict_resume: true,
        ..ReceiverOptions::default()
    };
    let server = TestServer::start_at(root.path(), options, None).await;
    let src = create_temp_dir();
    let path = create_test_file(src.path(), "big.bin", &random_bytes(CHUNK as usize * 2));

    let job = prepare_job(&path, CHUNK).await.with_resume_token("no-such-token");
    let err = server
        .client()
        .upload(&job, &CancellationToken::new())
        .await
        .expect_err("unknown token must be rejected");

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_retryable());
    assert!(!server.client_dir().join("big.bin").exists());
    assert!(server.partial_files().is_empty());
    assert!(server.sessions.is_empty().await);

    server.stop().await;
}

#[tokio::test]
async fn test_retry_resumes_after_dropped_connection() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let path = create_test_file(src.path(), "archive.zst", &random_bytes(CHUNK as usize * 6));

    // Handshake plus roughly two encoded chunks make it through.
    let proxy = FlakyProxy::start(server.addr, 15_000).await;
    let client = WithRetry::new(
        TcpTransferClient::new(proxy.addr.to_string(), common::client_options()),
        RetryCoordinator::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
            probe: false,
            ..RetryPolicy::default()
        }),
    );

    let job = prepare_job(&path, CHUNK).await;
    let outcome = client
        .upload(&job, &CancellationToken::new())
        .await
        .expect("upload through flaky link");

    assert!(outcome.chunks_skipped >= 1, "nothing was resumed");
    assert_eq!(outcome.chunks_skipped + outcome.chunks_sent, 6);
    assert_eq!(job.resume.get(), outcome.resume_token);
    assert_same_content(&server.client_dir().join("archive.zst"), &path);
    assert!(server.partial_files().is_empty());

    server.stop().await;
}
