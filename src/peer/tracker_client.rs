use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{FileRecord, PeerAddress};
use crate::protocol::{ProtocolError, Request, Response};

#[derive(Debug, Error)]
pub enum TrackerClientError {
    #[error("tracker unreachable after {attempts} attempts: {last}")]
    Unavailable { attempts: u32, last: io::Error },
    #[error("i/o error talking to tracker: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unexpected tracker reply: {0}")]
    UnexpectedReply(String),
    #[error("tracker rejected request: {0}")]
    Rejected(String),
}

/// One logical request per connection, as the tracker expects. Connect
/// failures are retried with a fixed backoff before surfacing as
/// [`TrackerClientError::Unavailable`].
pub struct TrackerClient {
    addr: String,
    retries: u32,
    backoff: Duration,
    io_timeout: Duration,
}

impl TrackerClient {
    pub fn new(addr: impl Into<String>, config: &Config) -> Self {
        Self {
            addr: addr.into(),
            retries: config.tracker_retries.max(1),
            backoff: Duration::from_millis(config.tracker_backoff_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, TrackerClientError> {
        let mut last: Option<io::Error> = None;
        for attempt in 1..=self.retries {
            match timeout(self.io_timeout, TcpStream::connect(&self.addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(err)) => {
                    warn!(attempt, error = %err, addr = %self.addr, "tracker connect failed");
                    last = Some(err);
                }
                Err(_) => {
                    warn!(attempt, addr = %self.addr, "tracker connect timed out");
                    last = Some(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(self.backoff).await;
            }
        }
        Err(TrackerClientError::Unavailable {
            attempts: self.retries,
            last: last.unwrap_or_else(|| io::Error::other("no attempt made")),
        })
    }

    async fn request(&self, request: &Request) -> Result<Response, TrackerClientError> {
        let stream = self.connect().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut line = request.to_line();
        debug!(request = %line, "tracker request");
        line.push('\n');
        timeout(self.io_timeout, write_half.write_all(line.as_bytes()))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;

        let mut reply = String::new();
        let read = timeout(
            self.io_timeout,
            BufReader::new(read_half).read_line(&mut reply),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??;
        if read == 0 {
            return Err(TrackerClientError::UnexpectedReply(
                "tracker closed the connection".to_string(),
            ));
        }
        debug!(reply = %reply.trim(), "tracker reply");
        match Response::parse(&reply)? {
            Response::Error(reason) => Err(TrackerClientError::Rejected(reason)),
            response => Ok(response),
        }
    }

    /// Register and receive the directory visible to us, empty when the
    /// tracker has nothing to offer yet.
    pub async fn register(
        &self,
        peer: &PeerAddress,
    ) -> Result<Vec<FileRecord>, TrackerClientError> {
        match self
            .request(&Request::Register { peer: peer.clone() })
            .await?
        {
            Response::SharedList(records) => Ok(records),
            Response::Registered => Ok(vec![]),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    pub async fn share(&self, record: &FileRecord) -> Result<(), TrackerClientError> {
        match self
            .request(&Request::Share {
                record: record.clone(),
            })
            .await?
        {
            Response::Success(_) => Ok(()),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    pub async fn share_private(
        &self,
        record: &FileRecord,
        allowed: &[PeerAddress],
    ) -> Result<(), TrackerClientError> {
        match self
            .request(&Request::SharePrivate {
                record: record.clone(),
                allowed: allowed.to_vec(),
            })
            .await?
        {
            Response::Success(_) => Ok(()),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    pub async fn unshare(&self, record: &FileRecord) -> Result<(), TrackerClientError> {
        match self
            .request(&Request::Unshare {
                record: record.clone(),
            })
            .await?
        {
            Response::Success(_) => Ok(()),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    pub async fn query(&self, keyword: &str) -> Result<Vec<FileRecord>, TrackerClientError> {
        match self
            .request(&Request::Query {
                keyword: keyword.to_string(),
            })
            .await?
        {
            Response::QueryHits(records) => Ok(records),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    /// Full recomputation of our visible directory, replacing any cached view.
    pub async fn refresh(
        &self,
        peer: &PeerAddress,
    ) -> Result<Vec<FileRecord>, TrackerClientError> {
        match self.request(&Request::Refresh { peer: peer.clone() }).await? {
            Response::Refreshed(records) => Ok(records),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    /// Candidate owners for a content hash; empty when the tracker knows
    /// nobody offering it to us.
    pub async fn peers_for(
        &self,
        file_hash: &str,
        requester: &PeerAddress,
    ) -> Result<Vec<PeerAddress>, TrackerClientError> {
        match self
            .request(&Request::GetPeers {
                file_hash: file_hash.to_string(),
                requester: requester.clone(),
            })
            .await?
        {
            Response::Peers(peers) => Ok(peers),
            Response::NotFound(_) => Ok(vec![]),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }

    pub async fn known_peers(&self) -> Result<Vec<PeerAddress>, TrackerClientError> {
        match self.request(&Request::GetKnownPeers).await? {
            Response::KnownPeers(peers) => Ok(peers),
            Response::NotFound(_) => Ok(vec![]),
            other => Err(TrackerClientError::UnexpectedReply(other.to_line())),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::models::{FileRecord, PeerAddress};
    use crate::peer::tracker_client::{TrackerClient, TrackerClientError};
    use crate::tracker::Tracker;

    async fn start_tracker() -> String {
        let tracker = Tracker::bind("127.0.0.1:0", Config::default())
            .await
            .unwrap();
        let addr = tracker.local_addr().unwrap();
        tokio::spawn(tracker.run());
        addr.to_string()
    }

    #[tokio::test]
    async fn register_share_refresh_cycle() {
        let addr = start_tracker().await;
        let client = TrackerClient::new(addr, &Config::default());
        let me = PeerAddress::new("127.0.0.1", 9100);

        assert!(client.register(&me).await.unwrap().is_empty());

        let record = FileRecord::new("a.txt", 64, "h1", me.clone());
        client.share(&record).await.unwrap();

        let refreshed = client.refresh(&me).await.unwrap();
        assert_eq!(refreshed, vec![record.clone()]);

        let peers = client.peers_for("h1", &me).await.unwrap();
        assert_eq!(peers, vec![me.clone()]);

        client.unshare(&record).await.unwrap();
        assert!(client.query("a.txt").await.unwrap().is_empty());
        assert!(client.peers_for("h1", &me).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unreachable_tracker_is_a_typed_failure() {
        let config = Config {
            tracker_retries: 2,
            tracker_backoff_ms: 10,
            io_timeout_ms: 500,
            ..Config::default()
        };
        // Nothing listens on port 9; connects are refused.
        let client = TrackerClient::new("127.0.0.1:9", &config);
        let err = client
            .register(&PeerAddress::new("127.0.0.1", 9100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerClientError::Unavailable { attempts: 2, .. }
        ));
    }
}
