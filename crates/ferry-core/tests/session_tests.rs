//! Session persistence across manager restarts and expiry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{create_temp_dir, create_test_file, prepare_job, random_bytes, TestServer};
use ferry_core::client::UploadJob;
use ferry_core::protocol::{ChunkData, TransferResponse};
use ferry_core::session::SessionManager;

const CHUNK: u64 = 4096;

fn chunk(job: &UploadJob, data: &[u8], index: u64) -> ChunkData {
    let (offset, len) = job.strategy.chunk_range(index, job.metadata.file_size);
    let last = index + 1 == job.chunk_count();
    ChunkData::new(
        job.transfer_id,
        index,
        data[offset as usize..(offset + len) as usize].to_vec(),
        last,
    )
}

fn record_files(state_dir: &std::path::Path) -> usize {
    std::fs::read_dir(state_dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

#[tokio::test]
async fn test_finalize_is_idempotent_across_restart() {
    let dir = create_temp_dir();
    let state_dir = dir.path().join("state");
    let destination = dir.path().join("restore.bin");
    let data = random_bytes(CHUNK as usize * 3 + 5);
    let source = create_test_file(dir.path(), "src/restore.bin", &data);
    let job = prepare_job(&source, CHUNK).await;
    let request = job.request();

    let manager = SessionManager::open(&state_dir).await.expect("open");
    let handle = manager
        .initialize(&request, destination.clone())
        .await
        .expect("initialize");
    for index in 0..job.chunk_count() {
        manager
            .record_chunk(handle.session_id, &chunk(&job, &data, index))
            .await
            .expect("record chunk");
    }
    let first = manager.finalize(handle.session_id).await.expect("finalize");
    assert_eq!(first, destination);
    drop(manager);

    let reopened = SessionManager::open(&state_dir).await.expect("reopen");
    let record = reopened.get(handle.session_id).await.expect("finalized record kept");
    assert_eq!(record.completed_chunks.len() as u64, job.chunk_count());

    let second = reopened
        .finalize(handle.session_id)
        .await
        .expect("finalize again");
    assert_eq!(second, destination);
    assert_eq!(std::fs::read(&destination).expect("read"), data);
    assert!(reopened.resume_info(&handle.resume_token).await.is_err());
}

#[tokio::test]
async fn test_expired_session_is_purged() {
    let server = TestServer::start().await;
    let src = create_temp_dir();
    let data = random_bytes(CHUNK as usize * 4);
    let path = create_test_file(src.path(), "stale.bin", &data);
    let job = prepare_job(&path, CHUNK).await;

    let mut raw = server.connect_raw().await;
    raw.send(&job.request()).await;
    let ack: TransferResponse = raw.recv().await;
    let token = ack.resume_token.expect("resume token");
    raw.send(&chunk(&job, &data, 0)).await;
    let _: ferry_core::protocol::ChunkResult = raw.recv().await;
    drop(raw);
    server.audit.wait_for_end(job.transfer_id).await;

    assert_eq!(server.partial_files().len(), 1);
    assert_eq!(record_files(&server.root.join("state")), 1);

    // Generous age keeps it.
    let kept = server
        .sessions
        .cleanup_expired(Duration::from_secs(3600))
        .await
        .expect("cleanup");
    assert_eq!(kept, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = server
        .sessions
        .cleanup_expired(Duration::ZERO)
        .await
        .expect("cleanup");
    assert_eq!(removed, 1);
    assert!(server.sessions.resume_info(&token).await.is_err());
    assert!(server.partial_files().is_empty());
    assert_eq!(record_files(&server.root.join("state")), 0);

    server.stop().await;
}

#[tokio::test]
async fn test_cleanup_task_sweeps_periodically() {
    let dir = create_temp_dir();
    let data = random_bytes(CHUNK as usize * 2);
    let source = create_test_file(dir.path(), "src/sweep.bin", &data);
    let job = prepare_job(&source, CHUNK).await;

    let manager = Arc::new(
        SessionManager::open(dir.path().join("state"))
            .await
            .expect("open"),
    );
    let handle = manager
        .initialize(&job.request(), dir.path().join("sweep.bin"))
        .await
        .expect("initialize");
    manager.release(handle.session_id).await;

    let task = manager.spawn_cleanup_task(Duration::from_millis(50), Duration::ZERO);
    for _ in 0..100 {
        if manager.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    task.stop().await;

    assert!(manager.is_empty().await);
    assert!(manager.get(handle.session_id).await.is_none());
}
