// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Worker-pool coordination for chunk parsing.
//!
//! Every in-flight chunk runs on its own named worker thread that opens the
//! source file, reads only its byte range and hands the bytes to a
//! [`ChunkParser`]. Results come back over a channel in completion order and
//! are re-ordered by chunk id before they are concatenated, so the merged
//! output never depends on scheduling.
//!
//! Workers share nothing mutable. A panic inside a parser is caught on the
//! worker and becomes that chunk's failure; sibling chunks are unaffected.

use crate::cancellation::{panic_message, CancellationToken};
use crate::chunk::FileChunk;
use crate::error::{ChunkError, ChunkFailure, LoadError, Result};
use crate::record::ChunkParser;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Default bounded wait for a single chunk
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Output of one worker for one chunk.
#[derive(Debug)]
pub struct WorkerResult<R> {
    pub chunk_id: usize,
    pub outcome: std::result::Result<Vec<R>, ChunkError>,
    pub elapsed: Duration,
}

enum Message<R> {
    Done(WorkerResult<R>),
    /// Sent by the token's cleanup callback so the loop notices a cancel
    /// without waiting for the next poll.
    Wake,
}

/// Dispatches chunks to a bounded set of worker threads.
#[derive(Debug, Clone)]
pub struct ChunkCoordinator {
    pool_size: Option<usize>,
    chunk_timeout: Duration,
}

impl Default for ChunkCoordinator {
    fn default() -> Self {
        Self::new(None, DEFAULT_CHUNK_TIMEOUT)
    }
}

impl ChunkCoordinator {
    /// `pool_size` of `None` uses the number of CPU cores.
    pub fn new(pool_size: Option<usize>, chunk_timeout: Duration) -> Self {
        Self {
            pool_size,
            chunk_timeout,
        }
    }

    /// Workers used for `chunk_count` chunks.
    pub fn pool_size_for(&self, chunk_count: usize) -> usize {
        self.pool_size
            .unwrap_or_else(num_cpus::get)
            .max(1)
            .min(chunk_count.max(1))
    }

    /// Parse every chunk and return all records in chunk-id order.
    ///
    /// Fails with [`LoadError::Cancelled`] if `token` trips (after in-flight
    /// chunks drain) and with [`LoadError::ParseFailed`] listing every failed
    /// chunk if any chunk fails. `progress` receives `(completed, total)` on
    /// the calling thread.
    pub fn coordinate_parsing<P>(
        &self,
        chunks: &[FileChunk],
        parser: Arc<P>,
        token: &CancellationToken,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Vec<P::Record>>
    where
        P: ChunkParser + ?Sized,
    {
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = FxHashSet::default();
        if let Some(dup) = chunks.iter().find(|c| !ids.insert(c.id)) {
            return Err(LoadError::InvalidInput(format!("duplicate chunk id {}", dup.id)));
        }

        let total = chunks.len();
        let pool_size = self.pool_size_for(total);
        let (tx, rx) = unbounded::<Message<P::Record>>();

        let wake_tx = tx.clone();
        let wake_id = token.register_cleanup_callback(move || {
            let _ = wake_tx.send(Message::Wake);
        });

        tracing::debug!(chunks = total, pool_size, "Dispatching chunks");

        let mut next = 0usize;
        let mut in_flight: FxHashMap<usize, Instant> = FxHashMap::default();
        let mut succeeded: Vec<(usize, Vec<P::Record>)> = Vec::with_capacity(total);
        let mut failures: Vec<ChunkFailure> = Vec::new();
        let mut spawn_error: Option<std::io::Error> = None;
        let mut completed = 0usize;

        loop {
            while spawn_error.is_none()
                && !token.is_cancelled()
                && in_flight.len() < pool_size
                && next < total
            {
                let chunk = &chunks[next];
                match spawn_worker(chunk.clone(), Arc::clone(&parser), tx.clone()) {
                    Ok(()) => {
                        in_flight.insert(chunk.id, Instant::now() + self.chunk_timeout);
                        next += 1;
                    }
                    Err(e) => {
                        tracing::error!(chunk_id = chunk.id, error = %e, "Failed to start chunk worker");
                        spawn_error = Some(e);
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            let now = Instant::now();
            let wait = in_flight
                .values()
                .min()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(POLL_INTERVAL)
                .min(POLL_INTERVAL);

            match rx.recv_timeout(wait) {
                Ok(Message::Done(result)) => {
                    if in_flight.remove(&result.chunk_id).is_none() {
                        tracing::debug!(chunk_id = result.chunk_id, "Ignoring result of timed-out chunk");
                        continue;
                    }
                    completed += 1;
                    match result.outcome {
                        Ok(payload) => {
                            tracing::debug!(
                                chunk_id = result.chunk_id,
                                records = payload.len(),
                                elapsed_ms = result.elapsed.as_millis() as u64,
                                "Chunk parsed"
                            );
                            succeeded.push((result.chunk_id, payload));
                        }
                        Err(error) => {
                            tracing::warn!(chunk_id = result.chunk_id, error = %error, "Chunk failed");
                            failures.push(ChunkFailure {
                                chunk_id: result.chunk_id,
                                error,
                            });
                        }
                    }
                    progress(completed, total);
                }
                Ok(Message::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            let expired: Vec<usize> = in_flight
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for chunk_id in expired {
                in_flight.remove(&chunk_id);
                completed += 1;
                tracing::warn!(chunk_id, timeout_secs = self.chunk_timeout.as_secs(), "Chunk timed out");
                failures.push(ChunkFailure {
                    chunk_id,
                    error: ChunkError::Timeout(self.chunk_timeout),
                });
                progress(completed, total);
            }
        }

        token.unregister_cleanup_callback(wake_id);

        if let Some(e) = spawn_error {
            return Err(LoadError::WorkerPool(format!("could not start worker thread: {}", e)));
        }
        if token.is_cancelled() {
            tracing::info!(completed, total, "Chunk parsing cancelled");
            return Err(LoadError::Cancelled);
        }
        if !failures.is_empty() {
            failures.sort_by_key(|f| f.chunk_id);
            return Err(LoadError::ParseFailed { total, failures });
        }

        succeeded.sort_by_key(|(chunk_id, _)| *chunk_id);
        let record_total = succeeded.iter().map(|(_, payload)| payload.len()).sum();
        let mut records = Vec::with_capacity(record_total);
        for (_, payload) in succeeded {
            records.extend(payload);
        }
        Ok(records)
    }
}

fn spawn_worker<P>(chunk: FileChunk, parser: Arc<P>, tx: Sender<Message<P::Record>>) -> std::io::Result<()>
where
    P: ChunkParser + ?Sized,
{
    thread::Builder::new()
        .name(format!("chunk-worker-{}", chunk.id))
        .spawn(move || {
            let started = Instant::now();
            let outcome = run_chunk(&chunk, &*parser);
            // The receiver is gone if the chunk already timed out.
            let _ = tx.send(Message::Done(WorkerResult {
                chunk_id: chunk.id,
                outcome,
                elapsed: started.elapsed(),
            }));
        })
        .map(|_| ())
}

fn run_chunk<P>(chunk: &FileChunk, parser: &P) -> std::result::Result<Vec<P::Record>, ChunkError>
where
    P: ChunkParser + ?Sized,
{
    let bytes = read_range(chunk).map_err(|e| ChunkError::Io(e.to_string()))?;

    let records = panic::catch_unwind(AssertUnwindSafe(|| parser.parse_chunk(chunk, &bytes)))
        .map_err(|payload| ChunkError::Panicked(panic_message(&*payload)))??;

    if records.len() as u64 != chunk.record_count {
        return Err(ChunkError::RecordCountMismatch {
            expected: chunk.record_count as usize,
            actual: records.len(),
        });
    }
    Ok(records)
}

fn read_range(chunk: &FileChunk) -> std::io::Result<Vec<u8>> {
    let len = usize::try_from(chunk.byte_size).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "chunk does not fit in memory")
    })?;
    let mut file = File::open(&chunk.path)?;
    file.seek(SeekFrom::Start(chunk.byte_start))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}
