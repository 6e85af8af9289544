use std::fs;
use std::io::Read as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Runtime knobs for tracker and peer. Defaults carry the normative
/// constants; a JSON file can override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed transfer chunk size in bytes.
    pub chunk_size: u64,
    /// Global cap on in-flight chunk workers per node.
    pub worker_gate: usize,
    /// A peer is available while its assigned task count is below this.
    pub max_tasks_per_peer: u32,
    /// Peer-selection attempts before a chunk attempt gives up.
    pub peer_select_attempts: u32,
    /// Pause between peer-selection attempts and gate polls, in ms.
    pub poll_interval_ms: u64,
    /// Peer selections per chunk in one `download_chunk_with_retry`.
    pub chunk_peer_selections: u32,
    /// Tries per (peer, chunk) worker attempt.
    pub worker_tries: u32,
    /// Linear backoff base after an I/O failure in a worker try, in ms.
    pub worker_io_backoff_ms: u64,
    /// Shorter linear backoff base after a malformed frame, in ms.
    pub worker_frame_backoff_ms: u64,
    /// Extra scheduler rounds over still-failing chunks.
    pub retry_rounds: u32,
    /// Inactivity timeout for secure-channel reads, in ms.
    pub io_timeout_ms: u64,
    /// Connect attempts against the tracker before giving up.
    pub tracker_retries: u32,
    /// Fixed backoff between tracker connect attempts, in ms.
    pub tracker_backoff_ms: u64,
    /// Interval between tracker liveness sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// How long one sweep collects PONGs, in ms.
    pub pong_window_ms: u64,
    /// A task with no progress update for this long is flagged stalled.
    pub stall_timeout_ms: u64,
    /// Where a peer stages its shared files.
    pub share_dir: PathBuf,
    /// Optional broadcast address for the liveness PING, e.g.
    /// "255.255.255.255:9000". Unicast to known peers always happens.
    pub ping_broadcast: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            worker_gate: 6,
            max_tasks_per_peer: 3,
            peer_select_attempts: 20,
            poll_interval_ms: 50,
            chunk_peer_selections: 3,
            worker_tries: 3,
            worker_io_backoff_ms: 1000,
            worker_frame_backoff_ms: 250,
            retry_rounds: 2,
            io_timeout_ms: 5000,
            tracker_retries: 3,
            tracker_backoff_ms: 1000,
            sweep_interval_secs: 10,
            pong_window_ms: 1000,
            stall_timeout_ms: 120_000,
            share_dir: PathBuf::from("shared_files"),
            ping_broadcast: None,
        }
    }
}

impl Config {
    /// Load overrides from a JSON file; missing fields keep their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut file = fs::OpenOptions::new().read(true).open(path)?;
        let mut buf = vec![];
        file.read_to_end(&mut buf)?;
        Ok(serde_json::from_slice::<Config>(&buf)?)
    }
}
