use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tracing::info;

use crate::models::ChunkSpec;
use crate::peer::models::{
    ChunkState, ChunkStatus, TaskKind, TaskProgress, TaskStatus,
};

/// Mutable bookkeeping of one share or download operation.
#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    total_bytes: u64,
    bytes_transferred: u64,
    chunks: HashMap<u32, ChunkState>,
    last_progress: Instant,
}

/// One long-running operation: progress, cancellation flag and the abort
/// handles of its outstanding workers. Shared between the scheduler, its
/// workers and observers.
#[derive(Debug)]
pub struct TaskHandle {
    id: String,
    kind: TaskKind,
    file_name: String,
    stall_timeout: Duration,
    cancelled: AtomicBool,
    paused: AtomicBool,
    state: Mutex<TaskState>,
    workers: Mutex<Vec<AbortHandle>>,
}

impl TaskHandle {
    fn new(id: String, kind: TaskKind, file_name: String, stall_timeout: Duration) -> Self {
        Self {
            id,
            kind,
            file_name,
            stall_timeout,
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(TaskState {
                status: TaskStatus::Starting,
                total_bytes: 0,
                bytes_transferred: 0,
                chunks: HashMap::new(),
                last_progress: Instant::now(),
            }),
            workers: Mutex::new(vec![]),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Cooperative: workers and the scheduler poll this at every loop
    /// iteration and around blocking network operations.
    pub fn request_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == TaskStatus::Downloading {
            state.status = TaskStatus::Paused;
            self.paused.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == TaskStatus::Paused {
            state.status = TaskStatus::Downloading;
            self.paused.store(false, Ordering::SeqCst);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancellation always wins: a task observed `Cancelled` is never
    /// re-labelled by a racing completion.
    pub fn set_status(&self, status: TaskStatus) {
        let mut state = self.state.lock().unwrap();
        if state.status == TaskStatus::Cancelled && status != TaskStatus::Cancelled {
            return;
        }
        state.status = status;
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    pub fn init_chunks(&self, specs: &[ChunkSpec], total_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.total_bytes = total_bytes;
        state.chunks = specs
            .iter()
            .map(|spec| (spec.index, ChunkState::new()))
            .collect();
    }

    pub fn set_total_bytes(&self, total_bytes: u64) {
        self.state.lock().unwrap().total_bytes = total_bytes;
    }

    pub fn chunk_status(&self, index: u32) -> Option<ChunkStatus> {
        self.state
            .lock()
            .unwrap()
            .chunks
            .get(&index)
            .map(|chunk| chunk.status)
    }

    pub fn mark_chunk_downloading(&self, index: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.chunks.get_mut(&index) {
            if chunk.status != ChunkStatus::Completed {
                chunk.status = ChunkStatus::Downloading;
                chunk.retry_count += 1;
                chunk.last_attempt = Some(Instant::now());
            }
        }
    }

    pub fn mark_chunk_failed(&self, index: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(chunk) = state.chunks.get_mut(&index) {
            if chunk.status != ChunkStatus::Completed {
                chunk.status = ChunkStatus::Failed;
            }
        }
    }

    /// Record a completed chunk once. Returns false for a stale duplicate;
    /// a `Completed` chunk is never re-counted, keeping
    /// `bytes_transferred == sum over completed chunks` intact.
    pub fn record_chunk_completed(&self, index: u32, bytes: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(chunk) = state.chunks.get_mut(&index) else {
            return false;
        };
        if chunk.status == ChunkStatus::Completed {
            return false;
        }
        chunk.status = ChunkStatus::Completed;
        chunk.bytes_transferred = bytes;
        state.bytes_transferred += bytes;
        state.last_progress = Instant::now();
        true
    }

    /// Byte-level advance for share staging, which has no chunk map.
    pub fn advance_bytes(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.bytes_transferred += bytes;
        state.last_progress = Instant::now();
    }

    /// Force the terminal accounting of a verified download.
    pub fn complete(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == TaskStatus::Cancelled {
            return;
        }
        state.status = TaskStatus::Completed;
        state.bytes_transferred = state.total_bytes;
    }

    pub fn add_worker(&self, handle: AbortHandle) {
        self.workers.lock().unwrap().push(handle);
    }

    pub fn abort_workers(&self) {
        for handle in self.workers.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    pub fn progress(&self) -> TaskProgress {
        let state = self.state.lock().unwrap();
        let percentage = if state.total_bytes == 0 {
            if state.status == TaskStatus::Completed {
                100
            } else {
                0
            }
        } else {
            (state.bytes_transferred * 100 / state.total_bytes) as u8
        };
        let stalled = !state.status.is_terminal()
            && state.status != TaskStatus::Starting
            && state.last_progress.elapsed() > self.stall_timeout;
        TaskProgress {
            id: self.id.clone(),
            kind: self.kind,
            file_name: self.file_name.clone(),
            status: state.status,
            total_bytes: state.total_bytes,
            bytes_transferred: state.bytes_transferred,
            percentage,
            stalled,
        }
    }
}

/// Owner of all task bookkeeping. `cleanup` is the only way entries are
/// released.
pub struct TaskRegistry {
    stall_timeout: Duration,
    tasks: Mutex<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            stall_timeout,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, kind: TaskKind, file_name: &str) -> Arc<TaskHandle> {
        let mut tasks = self.tasks.lock().unwrap();
        let id = loop {
            let candidate = format!("{}-{:08x}", kind.label(), rand::random::<u32>());
            if !tasks.contains_key(&candidate) {
                break candidate;
            }
        };
        let handle = Arc::new(TaskHandle::new(
            id.clone(),
            kind,
            file_name.to_string(),
            self.stall_timeout,
        ));
        tasks.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn snapshots(&self) -> Vec<TaskProgress> {
        let mut snapshots = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .map(|task| task.progress())
            .collect::<Vec<TaskProgress>>();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.get(id) {
            Some(task) => {
                info!(task = id, "cancellation requested");
                task.request_cancel();
                true
            }
            None => false,
        }
    }

    /// Remove bookkeeping for the given tasks, cancelling anything still
    /// outstanding and aborting residual worker handles.
    pub fn cleanup(&self, ids: &[String]) {
        let mut tasks = self.tasks.lock().unwrap();
        for id in ids {
            if let Some(task) = tasks.remove(id) {
                task.request_cancel();
                task.abort_workers();
                info!(task = id.as_str(), "task cleaned up");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::models::chunk_specs;
    use crate::peer::models::{ChunkStatus, TaskKind, TaskStatus};
    use crate::peer::tasks::TaskRegistry;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Duration::from_secs(120))
    }

    #[test]
    fn percentage_is_floored() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "a.bin");
        let specs = chunk_specs(1000, 300);
        task.init_chunks(&specs, 1000);
        task.set_status(TaskStatus::Downloading);
        assert!(task.record_chunk_completed(0, 300));
        // 300 / 1000 => 30%.
        assert_eq!(task.progress().percentage, 30);
        assert!(task.record_chunk_completed(3, 100));
        // 400 / 1000 => 40%; 399/1000 would floor to 39.
        assert_eq!(task.progress().percentage, 40);
    }

    #[test]
    fn completed_chunk_is_not_recounted() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "a.bin");
        task.init_chunks(&chunk_specs(600, 300), 600);
        assert!(task.record_chunk_completed(1, 300));
        assert!(!task.record_chunk_completed(1, 300));
        assert_eq!(task.progress().bytes_transferred, 300);
        assert_eq!(task.chunk_status(1), Some(ChunkStatus::Completed));
    }

    #[test]
    fn cancellation_wins_over_completion() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "a.bin");
        task.set_status(TaskStatus::Downloading);
        task.request_cancel();
        task.set_status(TaskStatus::Cancelled);
        // A racing worker reporting success must not flip the status back.
        task.set_status(TaskStatus::Completed);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn stalled_is_flagged_without_terminating() {
        let registry = TaskRegistry::new(Duration::ZERO);
        let task = registry.create(TaskKind::Download, "a.bin");
        task.init_chunks(&chunk_specs(100, 50), 100);
        task.set_status(TaskStatus::Downloading);
        std::thread::sleep(Duration::from_millis(5));
        let progress = task.progress();
        assert!(progress.stalled);
        assert_eq!(progress.status, TaskStatus::Downloading);
        assert!(!task.is_cancelled());
    }

    #[test]
    fn pause_and_resume_only_from_downloading() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "a.bin");
        task.pause();
        assert_eq!(task.status(), TaskStatus::Starting);
        task.set_status(TaskStatus::Downloading);
        task.pause();
        assert_eq!(task.status(), TaskStatus::Paused);
        assert!(task.is_paused());
        task.resume();
        assert_eq!(task.status(), TaskStatus::Downloading);
    }

    #[test]
    fn cleanup_cancels_and_removes() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "a.bin");
        let id = task.id().to_string();
        assert!(registry.get(&id).is_some());
        registry.cleanup(&[id.clone()]);
        assert!(registry.get(&id).is_none());
        assert!(task.is_cancelled());
    }

    #[test]
    fn zero_byte_task_reports_100_only_when_completed() {
        let registry = registry();
        let task = registry.create(TaskKind::Download, "empty.bin");
        task.init_chunks(&[], 0);
        task.set_status(TaskStatus::Downloading);
        assert_eq!(task.progress().percentage, 0);
        task.complete();
        assert_eq!(task.progress().percentage, 100);
    }
}
