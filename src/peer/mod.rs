pub mod balancer;
pub mod models;
mod scheduler;
pub mod share_store;
pub mod tasks;
pub mod tracker_client;
mod worker;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::{FileRecord, PeerAddress, Visibility};
use crate::protocol::{self, Request, Response};
use crate::utils;
use balancer::LoadBalancer;
use models::{TaskKind, TaskProgress, TaskStatus};
use share_store::{SharedFile, ShareStore};
use tasks::TaskRegistry;
use tracker_client::TrackerClient;

const STAGE_BUF_LEN: usize = 1 << 16;

/// One peer node: serves its shares to other peers, answers liveness
/// probes, and runs share/download operations against the tracker's
/// directory.
pub struct Node {
    address: PeerAddress,
    config: Config,
    tracker: TrackerClient,
    store: Arc<ShareStore>,
    tasks: Arc<TaskRegistry>,
    balancer: Arc<LoadBalancer>,
    gate: Arc<Semaphore>,
    /// Last directory view received from the tracker.
    directory: Mutex<Vec<FileRecord>>,
}

impl Node {
    /// Bind the serve sockets, register with the tracker and start serving.
    /// Registration failure after the client's bounded retries is fatal.
    pub async fn start(
        listen: &str,
        name: Option<String>,
        tracker_addr: &str,
        config: Config,
    ) -> anyhow::Result<Arc<Node>> {
        let listener = TcpListener::bind(listen).await?;
        let addr = listener.local_addr()?;
        // Liveness probes arrive over UDP on the same port the TCP server
        // uses.
        let udp = UdpSocket::bind(addr).await?;

        let address = PeerAddress {
            ip: addr.ip().to_string(),
            port: addr.port(),
            name,
        };
        let node = Arc::new(Node {
            tracker: TrackerClient::new(tracker_addr, &config),
            store: Arc::new(ShareStore::new()),
            tasks: Arc::new(TaskRegistry::new(Duration::from_millis(
                config.stall_timeout_ms,
            ))),
            balancer: Arc::new(LoadBalancer::new(
                config.max_tasks_per_peer,
                config.peer_select_attempts,
                Duration::from_millis(config.poll_interval_ms),
            )),
            gate: Arc::new(Semaphore::new(config.worker_gate)),
            directory: Mutex::new(vec![]),
            address,
            config,
        });

        tokio::spawn(node.clone().serve_tcp(listener));
        tokio::spawn(node.clone().serve_udp(udp));

        let shared_list = node.tracker.register(&node.address).await?;
        info!(
            addr = %node.address,
            visible = shared_list.len(),
            "registered with tracker"
        );
        *node.directory.lock().unwrap() = shared_list;
        // Shares staged in an earlier run are announced again.
        for file in node.store.all() {
            node.announce(&file).await?;
        }
        Ok(node)
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Stage a copy of `source` into the share directory, hashing it in the
    /// same pass, then publish the record. Returns the share task id.
    pub async fn share(
        self: &Arc<Self>,
        source: PathBuf,
        visibility: Visibility,
    ) -> anyhow::Result<String> {
        let metadata = tokio::fs::metadata(&source).await?;
        anyhow::ensure!(metadata.is_file(), "not a file: {}", source.display());
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow::anyhow!("unusable file name: {}", source.display()))?
            .to_string();

        let task = self.tasks.create(TaskKind::Share, &file_name);
        task.set_total_bytes(metadata.len());
        let id = task.id().to_string();
        let node = self.clone();
        let job = task.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = node
                .stage_and_announce(source, file_name, metadata.len(), visibility, job.clone())
                .await
            {
                warn!(task = job.id(), error = %err, "share failed");
                job.set_status(TaskStatus::Failed);
            }
        });
        task.add_worker(handle.abort_handle());
        Ok(id)
    }

    async fn stage_and_announce(
        &self,
        source: PathBuf,
        file_name: String,
        file_size: u64,
        visibility: Visibility,
        task: Arc<tasks::TaskHandle>,
    ) -> anyhow::Result<()> {
        task.set_status(TaskStatus::Sharing);
        tokio::fs::create_dir_all(&self.config.share_dir).await?;
        let staged_path = self.config.share_dir.join(&file_name);

        let mut reader = tokio::fs::File::open(&source).await?;
        let mut staged = tokio::fs::File::create(&staged_path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0_u8; STAGE_BUF_LEN];
        loop {
            if task.is_cancelled() {
                // A cancelled share cleans up its staged copy.
                drop(staged);
                if let Err(err) = tokio::fs::remove_file(&staged_path).await {
                    warn!(error = %err, "could not remove staged copy");
                }
                task.set_status(TaskStatus::Cancelled);
                info!(task = task.id(), "share cancelled");
                return Ok(());
            }
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            staged.write_all(&buf[..read]).await?;
            task.advance_bytes(read as u64);
        }
        staged.flush().await?;
        staged.sync_all().await?;

        let file_hash = utils::bytes_to_hex_encoding(hasher.finalize().as_slice());
        let record = FileRecord::new(&file_name, file_size, &file_hash, self.address.clone());
        let shared = SharedFile {
            record: record.clone(),
            path: staged_path,
            visibility: visibility.clone(),
        };
        self.store.insert(shared.clone());
        self.announce(&shared).await?;
        task.set_status(TaskStatus::Completed);
        info!(file = %file_name, hash = %file_hash, "file shared");
        Ok(())
    }

    async fn announce(&self, file: &SharedFile) -> anyhow::Result<()> {
        match &file.visibility {
            Visibility::Public => self.tracker.share(&file.record).await?,
            Visibility::Private(allowed) => {
                let allowed = allowed.iter().cloned().collect::<Vec<PeerAddress>>();
                self.tracker.share_private(&file.record, &allowed).await?;
            }
        }
        Ok(())
    }

    /// Stop offering a file: drop the staged copy and retract the record.
    pub async fn unshare(&self, file_name: &str) -> anyhow::Result<bool> {
        let Some(shared) = self.store.remove(file_name) else {
            return Ok(false);
        };
        if let Err(err) = tokio::fs::remove_file(&shared.path).await {
            warn!(file = file_name, error = %err, "could not remove staged copy");
        }
        self.tracker.unshare(&shared.record).await?;
        info!(file = file_name, "file unshared");
        Ok(true)
    }

    /// Start downloading `record` to `save_path`; candidates come from the
    /// tracker's GET_PEERS. Returns the download task id.
    pub async fn download(
        self: &Arc<Self>,
        record: FileRecord,
        save_path: PathBuf,
    ) -> anyhow::Result<String> {
        let candidates = self
            .tracker
            .peers_for(&record.file_hash, &self.address)
            .await?
            .into_iter()
            .filter(|peer| *peer != self.address)
            .collect::<Vec<PeerAddress>>();

        let task = self.tasks.create(TaskKind::Download, &record.file_name);
        let id = task.id().to_string();
        if candidates.is_empty() {
            warn!(file = %record.file_name, "no peers offer this file");
            task.set_total_bytes(record.file_size);
            task.set_status(TaskStatus::Failed);
            return Ok(id);
        }

        let ctx = scheduler::DownloadContext {
            record,
            save_path,
            candidates: Arc::new(candidates),
            task: task.clone(),
            balancer: self.balancer.clone(),
            gate: self.gate.clone(),
            config: self.config.clone(),
        };
        let job = task.clone();
        let handle = tokio::spawn(async move {
            let outcome = scheduler::run(ctx).await;
            info!(task = job.id(), outcome = ?outcome, "download finished");
        });
        task.add_worker(handle.abort_handle());
        Ok(id)
    }

    pub async fn query(&self, keyword: &str) -> anyhow::Result<Vec<FileRecord>> {
        Ok(self.tracker.query(keyword).await?)
    }

    /// Replace the cached directory view with a fresh one from the tracker.
    pub async fn refresh(&self) -> anyhow::Result<Vec<FileRecord>> {
        let records = self.tracker.refresh(&self.address).await?;
        *self.directory.lock().unwrap() = records.clone();
        Ok(records)
    }

    pub async fn known_peers(&self) -> anyhow::Result<Vec<PeerAddress>> {
        Ok(self.tracker.known_peers().await?)
    }

    /// Cached view from the last register/refresh.
    pub fn directory(&self) -> Vec<FileRecord> {
        self.directory.lock().unwrap().clone()
    }

    pub fn find_record(&self, file_name: &str) -> Option<FileRecord> {
        self.directory
            .lock()
            .unwrap()
            .iter()
            .find(|record| record.file_name == file_name)
            .cloned()
    }

    /// Direct peer-to-peer lookup: ask one peer whether it shares a file.
    pub async fn search(
        &self,
        peer: &PeerAddress,
        file_name: &str,
    ) -> anyhow::Result<Option<FileRecord>> {
        let io_timeout = Duration::from_millis(self.config.io_timeout_ms);
        let stream = timeout(io_timeout, TcpStream::connect(peer.endpoint())).await??;
        let (read_half, mut write_half) = stream.into_split();
        let mut line = Request::Search {
            file_name: file_name.to_string(),
        }
        .to_line();
        line.push('\n');
        timeout(io_timeout, write_half.write_all(line.as_bytes())).await??;
        let mut reply = String::new();
        timeout(
            io_timeout,
            BufReader::new(read_half).read_line(&mut reply),
        )
        .await??;
        match Response::parse(&reply)? {
            Response::FileInfo(record) => Ok(Some(record)),
            Response::FileNotFound(_) => Ok(None),
            other => anyhow::bail!("unexpected SEARCH reply: {}", other.to_line()),
        }
    }

    pub fn snapshots(&self) -> Vec<TaskProgress> {
        self.tasks.snapshots()
    }

    pub fn progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.tasks.get(task_id).map(|task| task.progress())
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.tasks.cancel(task_id)
    }

    pub fn pause(&self, task_id: &str) -> bool {
        match self.tasks.get(task_id) {
            Some(task) => {
                task.pause();
                true
            }
            None => false,
        }
    }

    pub fn resume(&self, task_id: &str) -> bool {
        match self.tasks.get(task_id) {
            Some(task) => {
                task.resume();
                true
            }
            None => false,
        }
    }

    /// Release bookkeeping for finished (or stuck) tasks.
    pub fn cleanup(&self, task_ids: &[String]) {
        self.tasks.cleanup(task_ids);
    }

    async fn serve_tcp(self: Arc<Self>, listener: TcpListener) {
        info!(addr = %self.address, "peer serving");
        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let node = self.clone();
            tokio::spawn(async move {
                node.handle_peer_connection(stream, remote.ip().to_string())
                    .await;
            });
        }
    }

    /// One request per connection, as with the tracker: SEARCH gets a text
    /// line back, GET_CHUNK a binary frame (or a textual refusal).
    async fn handle_peer_connection(&self, stream: TcpStream, requester_ip: String) {
        let (read_half, mut write_half) = stream.into_split();
        let mut line = String::new();
        let read = timeout(
            Duration::from_millis(self.config.io_timeout_ms),
            BufReader::new(read_half).read_line(&mut line),
        )
        .await;
        match read {
            Ok(Ok(read)) if read > 0 => {}
            _ => return,
        }

        let reply = match Request::parse(&line) {
            Ok(Request::Search { file_name }) => match self.store.get(&file_name) {
                Some(shared) => Response::FileInfo(shared.record),
                None => Response::FileNotFound(file_name),
            },
            Ok(Request::GetChunk { file_hash, index }) => {
                if let Err(err) = worker::serve_chunk(
                    &mut write_half,
                    &self.store,
                    &file_hash,
                    index,
                    self.config.chunk_size,
                    &requester_ip,
                )
                .await
                {
                    debug!(error = %err, "serving chunk failed");
                }
                return;
            }
            Ok(_) => Response::Error("unsupported peer request".to_string()),
            Err(err) => {
                warn!(request = %line.trim(), error = %err, "malformed peer request");
                Response::Error(err.to_string())
            }
        };
        let mut out = reply.to_line();
        out.push('\n');
        let _ = write_half.write_all(out.as_bytes()).await;
    }

    /// Answer the tracker's liveness probes.
    async fn serve_udp(self: Arc<Self>, socket: UdpSocket) {
        let mut buf = vec![0_u8; 1024];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "udp receive failed");
                    continue;
                }
            };
            if &buf[..len] == protocol::PING.as_bytes() {
                let pong = match &self.address.name {
                    Some(name) => format!("{}|{}", protocol::PONG, name),
                    None => protocol::PONG.to_string(),
                };
                if let Err(err) = socket.send_to(pong.as_bytes(), src).await {
                    warn!(error = %err, "pong send failed");
                }
                debug!(src = %src, "answered PING");
            }
        }
    }
}
