mod liveness;
pub mod registry;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::models::PeerAddress;
use crate::protocol::{Request, Response};
use registry::TrackerDirectory;

/// The coordinator: answers directory requests over TCP, one connection per
/// tokio task, and sweeps dead peers over UDP in the background.
pub struct Tracker {
    config: Config,
    listener: TcpListener,
    directory: Arc<Mutex<TrackerDirectory>>,
}

impl Tracker {
    pub async fn bind(listen: &str, config: Config) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            config,
            listener,
            directory: Arc::new(Mutex::new(TrackerDirectory::new())),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.listener.local_addr()?, "tracker listening");
        tokio::spawn(liveness::run_sweeps(
            self.directory.clone(),
            Duration::from_secs(self.config.sweep_interval_secs),
            Duration::from_millis(self.config.pong_window_ms),
            self.config.ping_broadcast.clone(),
        ));
        loop {
            let (stream, addr) = self.listener.accept().await?;
            debug!(peer = %addr, "connection accepted");
            let directory = self.directory.clone();
            tokio::spawn(async move {
                handle_connection(stream, directory).await;
                debug!(peer = %addr, "connection closed");
            });
        }
    }
}

/// Serve one connection: a line per request, a line per response. A
/// malformed request produces an error reply on this connection only.
async fn handle_connection(stream: TcpStream, directory: Arc<Mutex<TrackerDirectory>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    // Identity announced on this connection via REGISTER/REFRESH; QUERY
    // visibility for private shares is scoped to it.
    let mut session_peer: Option<PeerAddress> = None;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let reply = match Request::parse(&line) {
            Ok(request) => {
                debug!(request = %line.trim(), "request");
                dispatch(request, &mut session_peer, &directory)
            }
            Err(err) => {
                warn!(request = %line.trim(), error = %err, "malformed request");
                Response::Error(err.to_string())
            }
        };
        let mut out = reply.to_line();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn dispatch(
    request: Request,
    session_peer: &mut Option<PeerAddress>,
    directory: &Arc<Mutex<TrackerDirectory>>,
) -> Response {
    let mut directory = directory.lock().unwrap();
    match request {
        Request::Register { peer } => {
            info!(peer = %peer, "peer registered");
            *session_peer = Some(peer.clone());
            let records = directory.register(peer);
            if records.is_empty() {
                Response::Registered
            } else {
                Response::SharedList(records)
            }
        }
        Request::Share { record } => {
            info!(file = %record.file_name, owner = %record.owner, "public share");
            directory.share_public(vec![record]);
            Response::Success("Files shared successfully.".to_string())
        }
        Request::SharePrivate { record, allowed } => {
            info!(
                file = %record.file_name,
                owner = %record.owner,
                grants = allowed.len(),
                "private share"
            );
            directory.share_private(record, allowed.into_iter().collect());
            Response::Success("Files shared successfully.".to_string())
        }
        Request::Unshare { record } => {
            info!(file = %record.file_name, owner = %record.owner, "unshare");
            directory.unshare(&record);
            Response::Success(String::new())
        }
        Request::Query { keyword } => {
            Response::QueryHits(directory.query(&keyword, session_peer.as_ref()))
        }
        Request::Refresh { peer } => {
            *session_peer = Some(peer.clone());
            Response::Refreshed(directory.visible_to(&peer))
        }
        Request::GetPeers {
            file_hash,
            requester,
        } => {
            let peers = directory.peers_for(&file_hash, &requester);
            if peers.is_empty() {
                Response::NotFound(format!("No peers found for file hash: {}", file_hash))
            } else {
                Response::Peers(peers)
            }
        }
        Request::GetKnownPeers => Response::KnownPeers(directory.known_peers()),
        Request::Search { .. } | Request::GetChunk { .. } => {
            Response::Error("peer-to-peer request sent to tracker".to_string())
        }
    }
}
