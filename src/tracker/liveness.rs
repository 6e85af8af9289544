use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::models::PeerAddress;
use crate::protocol;
use crate::tracker::registry::TrackerDirectory;

/// Periodic PING/PONG probe. Runs forever, independent of request handling;
/// one failed sweep never takes the tracker down.
pub(super) async fn run_sweeps(
    directory: Arc<Mutex<TrackerDirectory>>,
    interval: Duration,
    window: Duration,
    broadcast: Option<String>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match sweep_once(&directory, window, broadcast.as_deref()).await {
            Ok(alive) => debug!(alive, "liveness sweep complete"),
            Err(err) => warn!(error = %err, "liveness sweep failed"),
        }
    }
}

/// One sweep: PING every known peer (plus the broadcast address when
/// configured), collect PONGs for the bounded window, then make the
/// responding set the new known-peer set and prune orphaned records.
pub(crate) async fn sweep_once(
    directory: &Arc<Mutex<TrackerDirectory>>,
    window: Duration,
    broadcast: Option<&str>,
) -> anyhow::Result<usize> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let known = {
        let directory = directory.lock().unwrap();
        directory.known_peers()
    };

    if let Some(addr) = broadcast {
        socket.set_broadcast(true)?;
        if let Err(err) = socket.send_to(protocol::PING.as_bytes(), addr).await {
            warn!(error = %err, addr, "broadcast PING failed");
        }
    }
    for peer in &known {
        if let Err(err) = socket
            .send_to(protocol::PING.as_bytes(), peer.endpoint())
            .await
        {
            warn!(error = %err, peer = %peer, "unicast PING failed");
        }
    }

    let mut alive: HashSet<PeerAddress> = HashSet::new();
    let mut buf = vec![0_u8; 1024];
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let Ok(received) = timeout(remaining, socket.recv_from(&mut buf)).await else {
            break;
        };
        let (len, src) = received?;
        let reply = String::from_utf8_lossy(&buf[..len]);
        let reply = reply.trim();
        if let Some(rest) = reply.strip_prefix(protocol::PONG) {
            let peer = match rest.strip_prefix(protocol::FIELD_SEPARATOR) {
                Some(name) if !name.is_empty() => {
                    PeerAddress::named(src.ip().to_string(), src.port(), name)
                }
                _ => PeerAddress::new(src.ip().to_string(), src.port()),
            };
            debug!(peer = %peer, "PONG received");
            alive.insert(peer);
        }
    }

    let count = alive.len();
    let mut directory = directory.lock().unwrap();
    directory.retain_alive(&alive);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use crate::models::{FileRecord, PeerAddress};
    use crate::protocol;
    use crate::tracker::liveness::sweep_once;
    use crate::tracker::registry::TrackerDirectory;

    /// A peer that answers PING with PONG from its own socket.
    async fn spawn_pong_responder() -> PeerAddress {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0_u8; 64];
            while let Ok((len, src)) = socket.recv_from(&mut buf).await {
                if &buf[..len] == protocol::PING.as_bytes() {
                    let _ = socket.send_to(protocol::PONG.as_bytes(), src).await;
                }
            }
        });
        PeerAddress::new(addr.ip().to_string(), addr.port())
    }

    #[tokio::test]
    async fn sweep_keeps_responders_and_prunes_silent_peers() {
        let live_peer = spawn_pong_responder().await;
        let dead_peer = PeerAddress::new("127.0.0.1", 1);

        let directory = Arc::new(Mutex::new(TrackerDirectory::new()));
        {
            let mut directory = directory.lock().unwrap();
            directory.register(live_peer.clone());
            directory.register(dead_peer.clone());
            directory.share_public(vec![
                FileRecord::new("alive.txt", 10, "h1", live_peer.clone()),
                FileRecord::new("dead.txt", 10, "h2", dead_peer.clone()),
            ]);
        }

        let alive = sweep_once(&directory, Duration::from_millis(500), None)
            .await
            .unwrap();
        assert_eq!(alive, 1);

        let directory = directory.lock().unwrap();
        assert_eq!(directory.known_peers(), vec![live_peer.clone()]);
        // The silent peer's files are gone from the next refresh.
        let visible = directory.visible_to(&live_peer);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].file_name, "alive.txt");
        assert!(directory.query("dead", None).is_empty());
    }

    #[tokio::test]
    async fn sweep_with_no_responders_empties_the_directory() {
        let directory = Arc::new(Mutex::new(TrackerDirectory::new()));
        {
            let mut directory = directory.lock().unwrap();
            directory.register(PeerAddress::new("127.0.0.1", 1));
        }
        sweep_once(&directory, Duration::from_millis(100), None)
            .await
            .unwrap();
        assert!(directory.lock().unwrap().known_peers().is_empty());
    }
}
