//! Common test utilities for `Ferry` integration tests.
//!
//! Provides a receiver running on a loopback port, a raw protocol
//! connection for driving the wire by hand, and recording doubles for the
//! storage and audit seams.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use ferry_core::audit::{AuditAction, AuditEvent, AuditSink};
use ferry_core::auth::{
    encode_bearer_token, Authenticator, ClientCredential, MemoryCredentialStore, Permission,
};
use ferry_core::client::{ClientOptions, TcpTransferClient, UploadJob};
use ferry_core::file::FileMetadata;
use ferry_core::protocol::{self, MessageLimit};
use ferry_core::server::{ReceiverOptions, ReceiverServices, Server};
use ferry_core::session::SessionManager;
use ferry_core::storage::{LocalStorage, StorageProvider};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Client with upload permission.
pub const CLIENT_ID: &str = "db-01";
/// Secret shared by every test credential.
pub const SECRET: &str = "s3cret";

/// Create a temporary directory for test files.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Create a test file with the given content.
pub fn create_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent directories");
    }
    std::fs::write(&path, content).expect("Failed to write test file");
    path
}

/// Generate random bytes for testing.
pub fn random_bytes(size: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Bearer token for a test client.
pub fn token_for(client_id: &str) -> String {
    encode_bearer_token(client_id, SECRET)
}

/// Credential store with one credential per rejection scenario.
pub fn credential_store() -> MemoryCredentialStore {
    let mut retired = ClientCredential::new("retired", SECRET, vec![Permission::UploadBackup]);
    retired.is_active = false;

    let mut lapsed = ClientCredential::new("lapsed", SECRET, vec![Permission::UploadBackup]);
    lapsed.expires_at = Some(Utc::now() - chrono::Duration::days(1));

    MemoryCredentialStore::new()
        .with_credential(ClientCredential::new(
            CLIENT_ID,
            SECRET,
            vec![Permission::UploadBackup],
        ))
        .with_credential(ClientCredential::new(
            "reader",
            SECRET,
            vec![Permission::ReadStatus],
        ))
        .with_credential(retired)
        .with_credential(lapsed)
}

/// Client options suited to loopback tests.
pub fn client_options() -> ClientOptions {
    ClientOptions {
        connect_timeout: Duration::from_secs(5),
        io_timeout: Duration::from_secs(10),
        progress_interval: 1024,
    }
}

/// Prepare an upload job for `path` as the default test client.
pub async fn prepare_job(path: &Path, chunk_size: u64) -> UploadJob {
    UploadJob::prepare(path, CLIENT_ID, token_for(CLIENT_ID))
        .await
        .expect("prepare job")
        .with_chunk_size(chunk_size)
}

/// Audit sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("lock").clone()
    }

    /// Events for one transfer.
    pub fn for_transfer(&self, transfer_id: Uuid) -> Vec<AuditAction> {
        self.events()
            .into_iter()
            .filter(|e| e.transfer_id == transfer_id)
            .map(|e| e.action)
            .collect()
    }

    /// Wait until a terminal event for `transfer_id` has been recorded.
    pub async fn wait_for_end(&self, transfer_id: Uuid) -> AuditAction {
        for _ in 0..500 {
            let ended = self.for_transfer(transfer_id).into_iter().find(|a| {
                matches!(
                    a,
                    AuditAction::TransferCompleted { .. }
                        | AuditAction::TransferFailed { .. }
                        | AuditAction::TransferRejected { .. }
                )
            });
            if let Some(action) = ended {
                return action;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {transfer_id} never ended");
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().expect("lock").push(event);
    }
}

/// Storage provider that counts calls and can report a fixed free space.
#[derive(Debug)]
pub struct CountingStorage {
    inner: LocalStorage,
    available: Option<u64>,
    destination_calls: AtomicUsize,
    space_calls: AtomicUsize,
}

impl CountingStorage {
    /// Count calls on top of local storage at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: LocalStorage::new(root),
            available: None,
            destination_calls: AtomicUsize::new(0),
            space_calls: AtomicUsize::new(0),
        }
    }

    /// Report `available` free bytes regardless of the real volume.
    pub fn with_available(mut self, available: u64) -> Self {
        self.available = Some(available);
        self
    }

    /// Total calls to either method.
    pub fn calls(&self) -> usize {
        self.destination_calls.load(Ordering::SeqCst) + self.space_calls.load(Ordering::SeqCst)
    }
}

impl StorageProvider for CountingStorage {
    fn destination_for(
        &self,
        client_id: &str,
        metadata: &FileMetadata,
    ) -> ferry_core::Result<PathBuf> {
        self.destination_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.destination_for(client_id, metadata)
    }

    fn available_space(&self, path: &Path) -> ferry_core::Result<u64> {
        self.space_calls.fetch_add(1, Ordering::SeqCst);
        match self.available {
            Some(available) => Ok(available),
            None => self.inner.available_space(path),
        }
    }
}

/// A receiver listening on a loopback port.
pub struct TestServer {
    /// Listen address
    pub addr: SocketAddr,
    /// Root holding `state/` and `store/`
    pub root: PathBuf,
    /// Shared session table
    pub sessions: Arc<SessionManager>,
    /// Recorded audit events
    pub audit: Arc<RecordingAudit>,
    /// Storage double
    pub storage: Arc<CountingStorage>,
    cancel: CancellationToken,
    task: JoinHandle<ferry_core::Result<()>>,
    _dir: Option<tempfile::TempDir>,
}

impl TestServer {
    /// Start a receiver in a fresh temporary directory.
    pub async fn start() -> Self {
        let dir = create_temp_dir();
        let root = dir.path().to_path_buf();
        let mut server = Self::start_at(&root, ReceiverOptions::default(), None).await;
        server._dir = Some(dir);
        server
    }

    /// Start a receiver over an existing root directory.
    pub async fn start_at(
        root: &Path,
        options: ReceiverOptions,
        storage: Option<CountingStorage>,
    ) -> Self {
        let bind = "127.0.0.1:0".parse().expect("addr");
        Self::start_on(bind, root, options, storage).await
    }

    /// Start a receiver on a specific address.
    pub async fn start_on(
        bind: SocketAddr,
        root: &Path,
        options: ReceiverOptions,
        storage: Option<CountingStorage>,
    ) -> Self {
        let sessions = Arc::new(
            SessionManager::open(root.join("state"))
                .await
                .expect("open session manager"),
        );
        let audit = Arc::new(RecordingAudit::default());
        let storage =
            Arc::new(storage.unwrap_or_else(|| CountingStorage::new(root.join("store"))));

        let services = ReceiverServices {
            sessions: Arc::clone(&sessions),
            authenticator: Authenticator::credentials_only(Arc::new(credential_store())),
            storage: Arc::clone(&storage) as Arc<dyn StorageProvider>,
            audit: Arc::clone(&audit) as Arc<dyn AuditSink>,
        };

        let server = Server::bind(bind, options, services)
            .await
            .expect("bind receiver");
        let addr = server.local_addr().expect("local addr");
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.run(cancel.clone()));

        Self {
            addr,
            root: root.to_path_buf(),
            sessions,
            audit,
            storage,
            cancel,
            task,
            _dir: None,
        }
    }

    /// Directory receiving the default client's files.
    pub fn client_dir(&self) -> PathBuf {
        self.root.join("store").join(CLIENT_ID)
    }

    /// Partial files left in the default client's directory.
    pub fn partial_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(self.client_dir()) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "part"))
            .collect()
    }

    /// Plain client for this server.
    pub fn client(&self) -> TcpTransferClient {
        TcpTransferClient::new(self.addr.to_string(), client_options())
    }

    /// Open a raw protocol connection.
    pub async fn connect_raw(&self) -> RawConnection {
        RawConnection {
            stream: TcpStream::connect(self.addr).await.expect("connect"),
        }
    }

    /// Stop accepting and wait for the accept loop to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.task
            .await
            .expect("server task")
            .expect("server run");
    }
}

/// A loopback address with nothing listening on it.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

/// Hand-driven protocol connection.
pub struct RawConnection {
    stream: TcpStream,
}

impl RawConnection {
    /// Send one framed JSON message.
    pub async fn send<T: Serialize>(&mut self, message: &T) {
        protocol::send_json(&mut self.stream, message)
            .await
            .expect("send message");
    }

    /// Receive one framed JSON control message.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> T {
        tokio::time::timeout(
            Duration::from_secs(10),
            protocol::recv_json(&mut self.stream, MessageLimit::Control),
        )
        .await
        .expect("receive timed out")
        .expect("receive message")
    }

    /// Write raw bytes (direct-path body).
    pub async fn write_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.expect("write body");
    }
}

/// TCP relay that cuts its first connection after forwarding a fixed
/// number of client bytes. Later connections pass through untouched.
pub struct FlakyProxy {
    /// Address clients connect to
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl FlakyProxy {
    /// Relay to `upstream`, cutting the first connection after `cut_after` bytes.
    pub async fn start(upstream: SocketAddr, cut_after: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let addr = listener.local_addr().expect("proxy addr");

        let task = tokio::spawn(async move {
            let mut first = true;
            while let Ok((inbound, _)) = listener.accept().await {
                let Ok(outbound) = TcpStream::connect(upstream).await else {
                    continue;
                };
                let limit = first.then_some(cut_after);
                first = false;
                tokio::spawn(relay(inbound, outbound, limit));
            }
        });

        Self { addr, task }
    }
}

impl Drop for FlakyProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn relay(mut inbound: TcpStream, mut outbound: TcpStream, limit: Option<usize>) {
    let Some(limit) = limit else {
        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
        return;
    };

    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();
    let downstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut out_read, &mut in_write).await;
    });

    let mut buf = vec![0u8; 8192];
    let mut forwarded = 0;
    while forwarded < limit {
        let n = match in_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n.min(limit - forwarded),
        };
        if out_write.write_all(&buf[..n]).await.is_err() {
            break;
        }
        forwarded += n;
    }

    downstream.abort();
    let _ = downstream.await;
}
