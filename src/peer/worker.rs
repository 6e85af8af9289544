use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::models::{ChunkSpec, PeerAddress};
use crate::peer::share_store::{ServeRefusal, ShareStore};
use crate::peer::tasks::TaskHandle;
use crate::protocol::{Request, Response};

enum TryFailure {
    Io(io::Error),
    Frame(&'static str),
    Cancelled,
}

/// One (peer, chunk) attempt: up to `worker_tries` internal tries against
/// the same peer. Errors never escape; the result is a plain success flag
/// reported back to the scheduler. The channel is closed on every path by
/// drop. Backoff is linear: `worker_io_backoff_ms × try` after an I/O
/// failure, the shorter `worker_frame_backoff_ms × try` after a bad frame.
pub(super) async fn fetch_chunk(
    peer: &PeerAddress,
    file_hash: &str,
    spec: ChunkSpec,
    file: &Arc<Mutex<File>>,
    task: &Arc<TaskHandle>,
    config: &Config,
) -> bool {
    let tries = config.worker_tries;
    let io_timeout = Duration::from_millis(config.io_timeout_ms);
    for try_number in 1..=tries {
        if task.is_cancelled() {
            return false;
        }
        task.mark_chunk_downloading(spec.index);
        match fetch_once(peer, file_hash, spec, task, io_timeout).await {
            Ok(data) => {
                if task.is_cancelled() {
                    return false;
                }
                {
                    let mut file = file.lock().await;
                    let write = async {
                        file.seek(SeekFrom::Start(spec.index as u64 * config.chunk_size))
                            .await?;
                        file.write_all(&data).await?;
                        file.flush().await
                    };
                    if let Err(err) = write.await {
                        warn!(chunk = spec.index, error = %err, "chunk write failed");
                        task.mark_chunk_failed(spec.index);
                        return false;
                    }
                }
                task.record_chunk_completed(spec.index, data.len() as u64);
                debug!(chunk = spec.index, peer = %peer, try_number, "chunk downloaded");
                return true;
            }
            Err(TryFailure::Cancelled) => return false,
            Err(TryFailure::Io(err)) => {
                warn!(chunk = spec.index, peer = %peer, try_number, error = %err, "chunk try failed");
                if try_number < tries {
                    tokio::time::sleep(
                        Duration::from_millis(config.worker_io_backoff_ms) * try_number,
                    )
                    .await;
                }
            }
            Err(TryFailure::Frame(reason)) => {
                warn!(chunk = spec.index, peer = %peer, try_number, reason, "bad chunk frame");
                if try_number < tries {
                    tokio::time::sleep(
                        Duration::from_millis(config.worker_frame_backoff_ms) * try_number,
                    )
                    .await;
                }
            }
        }
    }
    task.mark_chunk_failed(spec.index);
    false
}

async fn fetch_once(
    peer: &PeerAddress,
    file_hash: &str,
    spec: ChunkSpec,
    task: &Arc<TaskHandle>,
    io_timeout: Duration,
) -> Result<Vec<u8>, TryFailure> {
    // The secure-channel seam: the transport is assumed authenticated and
    // ordered, so a plain connect stands in for the TLS handshake here.
    let mut stream = timed(io_timeout, TcpStream::connect(peer.endpoint()))
        .await
        .map_err(TryFailure::Io)?;

    let mut request = Request::GetChunk {
        file_hash: file_hash.to_string(),
        index: spec.index,
    }
    .to_line();
    request.push('\n');
    timed(io_timeout, stream.write_all(request.as_bytes()))
        .await
        .map_err(TryFailure::Io)?;

    // Frame: 4-byte BE index, 4-byte BE length, payload. A textual refusal
    // (ACCESS_DENIED / FILE_NOT_FOUND) never matches the requested index,
    // so it lands here as a frame failure.
    let mut header = [0_u8; 4];
    timed(io_timeout, stream.read_exact(&mut header))
        .await
        .map_err(TryFailure::Io)?;
    let received_index = u32::from_be_bytes(header);
    if received_index != spec.index {
        return Err(TryFailure::Frame("index mismatch"));
    }

    timed(io_timeout, stream.read_exact(&mut header))
        .await
        .map_err(TryFailure::Io)?;
    let length = u32::from_be_bytes(header) as u64;
    if length == 0 {
        return Err(TryFailure::Frame("empty payload"));
    }
    if length != spec.len() {
        return Err(TryFailure::Frame("length mismatch"));
    }

    let mut data = vec![0_u8; length as usize];
    let mut filled = 0_usize;
    while filled < data.len() {
        if task.is_cancelled() {
            return Err(TryFailure::Cancelled);
        }
        let read = timed(io_timeout, stream.read(&mut data[filled..]))
            .await
            .map_err(TryFailure::Io)?;
        if read == 0 {
            return Err(TryFailure::Frame("short read"));
        }
        filled += read;
    }
    Ok(data)
}

/// A bounded-inactivity wrapper: every blocking read/write gets at most
/// `io_timeout` of silence.
async fn timed<T>(
    io_timeout: Duration,
    operation: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match timeout(io_timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "inactivity timeout",
        )),
    }
}

/// Serving side of GET_CHUNK: resolve the hash over our shares, enforce the
/// allowed-peer set for private records, then stream the byte range back as
/// an index/length-prefixed frame.
pub(super) async fn serve_chunk(
    writer: &mut OwnedWriteHalf,
    store: &ShareStore,
    file_hash: &str,
    index: u32,
    chunk_size: u64,
    requester_ip: &str,
) -> io::Result<()> {
    let shared = match store.authorize(file_hash, requester_ip) {
        Ok(shared) => shared,
        Err(ServeRefusal::AccessDenied) => {
            warn!(hash = file_hash, requester = requester_ip, "chunk request denied");
            return write_line(writer, &Response::AccessDenied).await;
        }
        Err(ServeRefusal::NotFound) => {
            debug!(hash = file_hash, "chunk request for unknown hash");
            return write_line(writer, &Response::FileNotFound(file_hash.to_string())).await;
        }
    };

    let start = index as u64 * chunk_size;
    if start >= shared.record.file_size {
        return write_line(writer, &Response::FileNotFound(file_hash.to_string())).await;
    }
    let length = chunk_size.min(shared.record.file_size - start);

    let mut file = File::open(&shared.path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut data = vec![0_u8; length as usize];
    file.read_exact(&mut data).await?;

    writer.write_all(&index.to_be_bytes()).await?;
    writer.write_all(&(length as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    debug!(hash = file_hash, chunk = index, bytes = length, "chunk served");
    Ok(())
}

async fn write_line(writer: &mut OwnedWriteHalf, response: &Response) -> io::Result<()> {
    let mut line = response.to_line();
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}
