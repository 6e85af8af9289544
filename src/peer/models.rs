use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Share,
    Download,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Share => "share",
            TaskKind::Download => "download",
        }
    }
}

/// Task state machine: `Starting -> (Sharing | Downloading) -> {Completed,
/// Failed, Cancelled}`, with `Paused` reachable from `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Starting,
    Sharing,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Starting => "starting",
            TaskStatus::Sharing => "sharing",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChunkState {
    pub status: ChunkStatus,
    pub bytes_transferred: u64,
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
}

impl ChunkState {
    pub fn new() -> Self {
        Self {
            status: ChunkStatus::Pending,
            bytes_transferred: 0,
            retry_count: 0,
            last_attempt: None,
        }
    }
}

impl Default for ChunkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal result of one download run. Expected outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    /// Some chunks failed every candidate; the partial file is left on disk.
    Failed,
    /// Assembled bytes do not hash to the advertised content hash.
    HashMismatch,
    Cancelled,
    /// Unrecoverable local failure (destination, hashing I/O).
    Error(String),
}

/// Point-in-time view of a task for observers.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub id: String,
    pub kind: TaskKind,
    pub file_name: String,
    pub status: TaskStatus,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub percentage: u8,
    pub stalled: bool,
}
