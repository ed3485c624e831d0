//! Wire-level misbehaviour driven through a raw connection.

mod common;

use common::{create_temp_dir, create_test_file, prepare_job, random_bytes, TestServer};
use ferry_core::audit::AuditAction;
use ferry_core::checksum;
use ferry_core::error::ErrorKind;
use ferry_core::protocol::{ChunkData, ChunkResult, TransferResponse};

const CHUNK: u64 = 4096;

#[tokio::test]
async fn test_out_of_order_chunk_keeps_session() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let data = random_bytes(CHUNK as usize * 3);
    let path = create_test_file(src.path(), "ordered.bin", &data);
    let job = prepare_job(&path, CHUNK).await;

    let mut raw = server.connect_raw().await;
    raw.send(&job.request()).await;
    let ack: TransferResponse = raw.recv().await;
    let token = ack.resume_token.expect("resume token");

    let second = data[CHUNK as usize..2 * CHUNK as usize].to_vec();
    raw.send(&ChunkData::new(job.transfer_id, 1, second, false)).await;
    let result: ChunkResult = raw.recv().await;

    assert!(!result.success);
    assert_eq!(result.chunk_index, 1);
    assert_eq!(result.error_kind, Some(ErrorKind::ProtocolViolation));
    assert!(result.error_message.is_some());

    match server.audit.wait_for_end(job.transfer_id).await {
        AuditAction::TransferFailed { kind, .. } => assert_eq!(kind, ErrorKind::ProtocolViolation),
        other => panic!("unexpected end event: {other:?}"),
    }

    let info = server.sessions.resume_info(&token).await.expect("session kept");
    assert!(info.completed_chunks.is_empty());
    assert!(!server.client_dir().join("ordered.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_corrupted_chunk_discards_session() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let data = random_bytes(CHUNK as usize * 2);
    let path = create_test_file(src.path(), "corrupt.bin", &data);
    let job = prepare_job(&path, CHUNK).await;

    let mut raw = server.connect_raw().await;
    raw.send(&job.request()).await;
    let ack: TransferResponse = raw.recv().await;
    let token = ack.resume_token.expect("resume token");

    let mut chunk = ChunkData::new(job.transfer_id, 0, data[..CHUNK as usize].to_vec(), false);
    chunk.data[7] ^= 0xff;
    raw.send(&chunk).await;
    let result: ChunkResult = raw.recv().await;

    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ChecksumMismatch));

    server.audit.wait_for_end(job.transfer_id).await;
    assert!(server.sessions.resume_info(&token).await.is_err());
    assert!(server.partial_files().is_empty());
    assert!(!server.client_dir().join("corrupt.bin").exists());

    server.stop().await;
}

#[tokio::test]
async fn test_direct_digest_mismatch_rejected() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let data = random_bytes(2000);
    let path = create_test_file(src.path(), "small.cfg", &data);
    let job = prepare_job(&path, CHUNK).await;

    let mut request = job.request();
    request.metadata.checksum_sha256 = checksum::sha256_bytes(b"something else");

    let mut raw = server.connect_raw().await;
    raw.send(&request).await;
    let ack: TransferResponse = raw.recv().await;
    assert!(ack.success);
    assert!(ack.resume_token.is_none());

    raw.write_raw(&data).await;
    let response: TransferResponse = raw.recv().await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::ChecksumMismatch));
    assert!(!server.client_dir().join("small.cfg").exists());
    assert!(server.partial_files().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_handshake_rejected() {
    let server = TestServer::start().await;
    let mut raw = server.connect_raw().await;

    raw.send(&serde_json::json!({ "hello": "receiver" })).await;
    let response: TransferResponse = raw.recv().await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::ProtocolViolation));
    assert_eq!(server.storage.calls(), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_handshake_rejected() {
    let server = TestServer::start().await;
    let mut raw = server.connect_raw().await;

    raw.write_raw(&(64u32 * 1024 * 1024).to_le_bytes()).await;
    let response: TransferResponse = raw.recv().await;

    assert!(!response.success);
    assert_eq!(response.error_kind, Some(ErrorKind::ProtocolViolation));
    assert!(server.sessions.is_empty().await);

    server.stop().await;
}
