use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::models::{chunk_specs, ChunkSpec, FileRecord, PeerAddress};
use crate::peer::balancer::LoadBalancer;
use crate::peer::models::{ChunkStatus, DownloadOutcome, TaskStatus};
use crate::peer::tasks::TaskHandle;
use crate::peer::worker;
use crate::utils;

/// Everything one download run needs. The gate and balancer are shared
/// across the node's tasks; the rest is per download.
pub(super) struct DownloadContext {
    pub record: FileRecord,
    pub save_path: PathBuf,
    pub candidates: Arc<Vec<PeerAddress>>,
    pub task: Arc<TaskHandle>,
    pub balancer: Arc<LoadBalancer>,
    pub gate: Arc<Semaphore>,
    pub config: Config,
}

/// Orchestrate one download: a gated first pass over all chunks, bounded
/// retry rounds over the failures, then the whole-file hash barrier.
pub(super) async fn run(ctx: DownloadContext) -> DownloadOutcome {
    let task = ctx.task.clone();
    let file_size = ctx.record.file_size;

    if let Some(parent) = ctx.save_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            task.set_status(TaskStatus::Failed);
            return DownloadOutcome::Error(format!(
                "save directory does not exist: {}",
                parent.display()
            ));
        }
    }

    // Preallocate the sparse destination; every worker writes its own range.
    let file = match File::create(&ctx.save_path).await {
        Ok(file) => file,
        Err(err) => {
            task.set_status(TaskStatus::Failed);
            return DownloadOutcome::Error(format!("cannot create destination: {}", err));
        }
    };
    if let Err(err) = file.set_len(file_size).await {
        task.set_status(TaskStatus::Failed);
        return DownloadOutcome::Error(format!("cannot preallocate destination: {}", err));
    }
    let file = Arc::new(Mutex::new(file));

    let specs = chunk_specs(file_size, ctx.config.chunk_size);
    task.init_chunks(&specs, file_size);
    task.set_status(TaskStatus::Downloading);
    info!(
        task = task.id(),
        file = %ctx.record.file_name,
        chunks = specs.len(),
        peers = ctx.candidates.len(),
        "download started"
    );

    // Round 0 covers every chunk; each later round only the still-failing
    // ones. A chunk keeps its used-peer set across rounds so it is never
    // handed back to a peer that already failed it.
    let mut pending: Vec<(ChunkSpec, HashSet<PeerAddress>)> =
        specs.iter().map(|spec| (*spec, HashSet::new())).collect();

    for round in 0..=ctx.config.retry_rounds {
        if pending.is_empty() || task.is_cancelled() {
            break;
        }
        if round > 0 {
            info!(task = task.id(), round, chunks = pending.len(), "retrying failed chunks");
        }
        let mut handles: Vec<JoinHandle<(ChunkSpec, HashSet<PeerAddress>, bool)>> = vec![];
        for (spec, used) in pending.drain(..) {
            let Some(permit) = acquire_gate_slot(&ctx, &task).await else {
                // Cancellation observed while waiting for a slot.
                break;
            };
            let handle = tokio::spawn(download_chunk_with_retry(
                ctx.record.file_hash.clone(),
                spec,
                used,
                ctx.candidates.clone(),
                ctx.balancer.clone(),
                task.clone(),
                file.clone(),
                ctx.config.clone(),
                permit,
            ));
            task.add_worker(handle.abort_handle());
            handles.push(handle);
        }
        let mut still_failing = vec![];
        for handle in handles {
            match handle.await {
                Ok((_spec, _used, true)) => {}
                Ok((spec, used, false)) => still_failing.push((spec, used)),
                // Aborted worker: cancellation is handled below.
                Err(_) => {}
            }
        }
        pending = still_failing;
    }

    if task.is_cancelled() {
        task.abort_workers();
        drop(file);
        if let Err(err) = tokio::fs::remove_file(&ctx.save_path).await {
            warn!(task = task.id(), error = %err, "could not delete partial download");
        }
        task.set_status(TaskStatus::Cancelled);
        info!(task = task.id(), "download cancelled");
        return DownloadOutcome::Cancelled;
    }

    if !pending.is_empty() {
        // Left on disk for manual resumption; never deleted automatically.
        task.set_status(TaskStatus::Failed);
        warn!(
            task = task.id(),
            chunks = pending.len(),
            "download failed: chunks exhausted all candidates"
        );
        return DownloadOutcome::Failed;
    }

    // All chunks completed: the hash check is a barrier over the whole file.
    {
        let mut file = file.lock().await;
        if let Err(err) = file.sync_all().await {
            task.set_status(TaskStatus::Failed);
            return DownloadOutcome::Error(format!("cannot sync destination: {}", err));
        }
    }
    let hash_path = ctx.save_path.clone();
    let computed = tokio::task::spawn_blocking(move || utils::hash_file(&hash_path)).await;
    let computed = match computed {
        Ok(Ok(hash)) => hash,
        Ok(Err(err)) => {
            task.set_status(TaskStatus::Failed);
            return DownloadOutcome::Error(format!("cannot hash downloaded file: {}", err));
        }
        Err(err) => {
            task.set_status(TaskStatus::Failed);
            return DownloadOutcome::Error(format!("hashing task failed: {}", err));
        }
    };
    if !computed.eq_ignore_ascii_case(&ctx.record.file_hash) {
        task.set_status(TaskStatus::Failed);
        warn!(
            task = task.id(),
            expected = %ctx.record.file_hash,
            computed = %computed,
            "hash mismatch"
        );
        return DownloadOutcome::HashMismatch;
    }

    task.complete();
    info!(task = task.id(), bytes = file_size, "download completed");
    DownloadOutcome::Completed
}

/// Block until the global in-flight-worker gate has a free slot, polling on
/// the configured interval. Pausing holds submissions without giving up;
/// cancellation aborts the wait.
async fn acquire_gate_slot(
    ctx: &DownloadContext,
    task: &Arc<TaskHandle>,
) -> Option<OwnedSemaphorePermit> {
    let poll = Duration::from_millis(ctx.config.poll_interval_ms);
    loop {
        if task.is_cancelled() {
            return None;
        }
        if task.is_paused() {
            tokio::time::sleep(poll).await;
            continue;
        }
        match ctx.gate.clone().try_acquire_owned() {
            Ok(permit) => return Some(permit),
            Err(_) => tokio::time::sleep(poll).await,
        }
    }
}

/// Up to `chunk_peer_selections` peer selections for one chunk, each one a
/// full worker attempt against a peer not yet tried for this chunk. The
/// admission lease is released exactly when the attempt finishes, success
/// or not. Returns the used-peer set so retry rounds keep excluding peers
/// that already failed this chunk.
#[allow(clippy::too_many_arguments)]
async fn download_chunk_with_retry(
    file_hash: String,
    spec: ChunkSpec,
    mut used: HashSet<PeerAddress>,
    candidates: Arc<Vec<PeerAddress>>,
    balancer: Arc<LoadBalancer>,
    task: Arc<TaskHandle>,
    file: Arc<Mutex<File>>,
    config: Config,
    _permit: OwnedSemaphorePermit,
) -> (ChunkSpec, HashSet<PeerAddress>, bool) {
    // Stale resubmission after a racing completion: nothing to do.
    if task.chunk_status(spec.index) == Some(ChunkStatus::Completed) {
        return (spec, used, true);
    }
    let poll = Duration::from_millis(config.poll_interval_ms);
    for selection in 1..=config.chunk_peer_selections {
        if task.is_cancelled() {
            return (spec, used, false);
        }
        let cancelled = || task.is_cancelled();
        let Some(lease) = balancer
            .select_available_peer(&candidates, &used, cancelled)
            .await
        else {
            // Nobody eligible within the balancer's budget: the chunk
            // attempt fails immediately.
            task.mark_chunk_failed(spec.index);
            return (spec, used, false);
        };
        let peer = lease.peer().clone();
        used.insert(peer.clone());
        let ok = worker::fetch_chunk(&peer, &file_hash, spec, &file, &task, &config).await;
        drop(lease);
        if ok {
            return (spec, used, true);
        }
        if selection < config.chunk_peer_selections {
            tokio::time::sleep(poll * selection).await;
        }
    }
    task.mark_chunk_failed(spec.index);
    (spec, used, false)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    use crate::config::Config;
    use crate::models::{FileRecord, PeerAddress};
    use crate::peer::balancer::LoadBalancer;
    use crate::peer::models::{DownloadOutcome, TaskKind, TaskStatus};
    use crate::peer::scheduler::{run, DownloadContext};
    use crate::peer::tasks::{TaskHandle, TaskRegistry};
    use crate::utils;

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Answer every GET_CHUNK with the right bytes.
        Serve,
        /// Answer with a mismatched chunk index; every try fails.
        WrongIndex,
        /// Accept the request and go silent until the client times out.
        Stall,
    }

    /// A source peer serving chunks of `data`; the counter records how many
    /// chunk requests reached it.
    async fn spawn_source_peer(
        data: Arc<Vec<u8>>,
        chunk_size: u64,
        behavior: Behavior,
    ) -> (PeerAddress, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let data = data.clone();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut line = String::new();
                    if BufReader::new(read_half).read_line(&mut line).await.is_err() {
                        return;
                    }
                    let Some(index) = line
                        .trim()
                        .strip_prefix("GET_CHUNK|")
                        .and_then(|rest| rest.rsplit('|').next())
                        .and_then(|index| index.parse::<u32>().ok())
                    else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    match behavior {
                        Behavior::Serve => {
                            let start = index as usize * chunk_size as usize;
                            let len = (chunk_size as usize).min(data.len() - start);
                            let _ = write_half.write_all(&index.to_be_bytes()).await;
                            let _ = write_half.write_all(&(len as u32).to_be_bytes()).await;
                            let _ = write_half.write_all(&data[start..start + len]).await;
                        }
                        Behavior::WrongIndex => {
                            let _ = write_half.write_all(&(index + 1).to_be_bytes()).await;
                            let _ = write_half.write_all(&1_u32.to_be_bytes()).await;
                            let _ = write_half.write_all(&[0]).await;
                        }
                        Behavior::Stall => {
                            tokio::time::sleep(Duration::from_secs(60)).await;
                        }
                    }
                });
            }
        });
        (
            PeerAddress::new(addr.ip().to_string(), addr.port()),
            hits,
        )
    }

    fn test_config(chunk_size: u64) -> Config {
        Config {
            chunk_size,
            poll_interval_ms: 10,
            worker_io_backoff_ms: 10,
            worker_frame_backoff_ms: 10,
            io_timeout_ms: 500,
            ..Config::default()
        }
    }

    fn context(
        record: FileRecord,
        save_path: std::path::PathBuf,
        candidates: Vec<PeerAddress>,
        config: Config,
    ) -> (DownloadContext, Arc<TaskHandle>) {
        let registry = TaskRegistry::new(Duration::from_secs(120));
        let task = registry.create(TaskKind::Download, &record.file_name);
        let ctx = DownloadContext {
            record,
            save_path,
            candidates: Arc::new(candidates),
            task: task.clone(),
            balancer: Arc::new(LoadBalancer::new(
                config.max_tasks_per_peer,
                config.peer_select_attempts,
                Duration::from_millis(config.poll_interval_ms),
            )),
            gate: Arc::new(Semaphore::new(config.worker_gate)),
            config,
        };
        (ctx, task)
    }

    fn payload(len: usize) -> Arc<Vec<u8>> {
        Arc::new((0..len).map(|i| (i * 31 % 251) as u8).collect())
    }

    #[tokio::test]
    async fn five_megabyte_file_downloads_from_two_peers() {
        let chunk_size = 2 * 1024 * 1024;
        let data = payload(5 * 1024 * 1024);
        let hash = utils::hash_bytes(&data);
        let (peer_a, hits_a) = spawn_source_peer(data.clone(), chunk_size, Behavior::Serve).await;
        let (peer_b, hits_b) = spawn_source_peer(data.clone(), chunk_size, Behavior::Serve).await;

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("big.bin");
        let record = FileRecord::new("big.bin", data.len() as u64, &hash, peer_a.clone());
        let (ctx, task) = context(
            record,
            save_path.clone(),
            vec![peer_a, peer_b],
            test_config(chunk_size),
        );

        assert_eq!(run(ctx).await, DownloadOutcome::Completed);
        let progress = task.progress();
        assert_eq!(progress.status, TaskStatus::Completed);
        assert_eq!(progress.bytes_transferred, 5_242_880);
        assert_eq!(progress.percentage, 100);
        assert_eq!(utils::hash_file(&save_path).unwrap(), hash);
        // 3 chunks split across both sources.
        assert_eq!(hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_chunk_is_retried_on_a_different_peer() {
        let chunk_size = 64;
        let data = payload(64);
        let hash = utils::hash_bytes(&data);
        // Candidate-list order puts the broken peer first; its failure must
        // push the chunk to the good peer, never back to it.
        let (broken, broken_hits) =
            spawn_source_peer(data.clone(), chunk_size, Behavior::WrongIndex).await;
        let (good, good_hits) = spawn_source_peer(data.clone(), chunk_size, Behavior::Serve).await;

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("small.bin");
        let record = FileRecord::new("small.bin", data.len() as u64, &hash, broken.clone());
        let config = Config {
            worker_tries: 1,
            ..test_config(chunk_size)
        };
        let (ctx, task) = context(record, save_path, vec![broken, good], config);

        assert_eq!(run(ctx).await, DownloadOutcome::Completed);
        assert_eq!(task.progress().status, TaskStatus::Completed);
        assert_eq!(broken_hits.load(Ordering::SeqCst), 1);
        assert_eq!(good_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_every_candidate_fails_and_keeps_the_partial_file() {
        let chunk_size = 64;
        let data = payload(64);
        let hash = utils::hash_bytes(&data);
        let (bad_a, _) = spawn_source_peer(data.clone(), chunk_size, Behavior::WrongIndex).await;
        let (bad_b, _) = spawn_source_peer(data.clone(), chunk_size, Behavior::WrongIndex).await;

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("doomed.bin");
        let record = FileRecord::new("doomed.bin", data.len() as u64, &hash, bad_a.clone());
        let config = Config {
            worker_tries: 1,
            peer_select_attempts: 2,
            ..test_config(chunk_size)
        };
        let (ctx, task) = context(record, save_path.clone(), vec![bad_a, bad_b], config);

        assert_eq!(run(ctx).await, DownloadOutcome::Failed);
        assert_eq!(task.progress().status, TaskStatus::Failed);
        // Left on disk for manual resumption.
        assert!(save_path.exists());
    }

    #[tokio::test]
    async fn cancellation_deletes_the_partial_file() {
        let chunk_size = 64;
        let data = payload(256);
        let hash = utils::hash_bytes(&data);
        let (stalled, _) = spawn_source_peer(data.clone(), chunk_size, Behavior::Stall).await;

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("cancelled.bin");
        let record = FileRecord::new("cancelled.bin", data.len() as u64, &hash, stalled.clone());
        let (ctx, task) = context(record, save_path.clone(), vec![stalled], test_config(chunk_size));

        let download = tokio::spawn(run(ctx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.request_cancel();

        assert_eq!(download.await.unwrap(), DownloadOutcome::Cancelled);
        assert_eq!(task.progress().status, TaskStatus::Cancelled);
        assert!(!save_path.exists());
    }

    #[tokio::test]
    async fn advertised_hash_mismatch_is_its_own_failure() {
        let chunk_size = 64;
        let data = payload(64);
        let (peer, _) = spawn_source_peer(data.clone(), chunk_size, Behavior::Serve).await;

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("tampered.bin");
        let record = FileRecord::new("tampered.bin", data.len() as u64, "0000dead", peer.clone());
        let (ctx, task) = context(record, save_path.clone(), vec![peer], test_config(chunk_size));

        assert_eq!(run(ctx).await, DownloadOutcome::HashMismatch);
        assert_eq!(task.progress().status, TaskStatus::Failed);
        // All bytes arrived intact; only the advertised hash was wrong.
        assert!(save_path.exists());
        assert_eq!(utils::hash_file(&save_path).unwrap(), utils::hash_bytes(&data));
    }

    #[tokio::test]
    async fn unwritable_destination_is_an_error() {
        let chunk_size = 64;
        let data = payload(64);
        let hash = utils::hash_bytes(&data);
        let (peer, _) = spawn_source_peer(data.clone(), chunk_size, Behavior::Serve).await;

        let save_path = std::path::PathBuf::from("/nonexistent-dir/out.bin");
        let record = FileRecord::new("out.bin", data.len() as u64, &hash, peer.clone());
        let (ctx, task) = context(record, save_path, vec![peer], test_config(chunk_size));

        assert!(matches!(run(ctx).await, DownloadOutcome::Error(_)));
        assert_eq!(task.progress().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn no_candidates_at_all_fails_within_the_selection_budget() {
        let chunk_size = 64;
        let data = payload(64);
        let hash = utils::hash_bytes(&data);

        let dir = tempfile::tempdir().unwrap();
        let save_path = dir.path().join("nobody.bin");
        let record = FileRecord::new(
            "nobody.bin",
            data.len() as u64,
            &hash,
            PeerAddress::new("127.0.0.1", 1),
        );
        let config = Config {
            peer_select_attempts: 2,
            ..test_config(chunk_size)
        };
        let (ctx, task) = context(record, save_path, vec![], config);

        assert_eq!(run(ctx).await, DownloadOutcome::Failed);
        assert_eq!(task.progress().status, TaskStatus::Failed);
    }
}
