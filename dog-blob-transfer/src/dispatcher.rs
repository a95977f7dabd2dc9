use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::governor::ExecutionGovernor;
use crate::planner::{ChunkReader, PlannedChunk};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::state::TransferState;
use crate::{TransferError, TransferResult};

/// One network attempt at moving a chunk. Retries and budgets are the
/// dispatcher's business, implementations only make the call.
#[async_trait]
pub trait ChunkTransfer: Send + Sync + 'static {
    /// What a successful chunk leaves behind, reassembled by position
    type Output: Send + 'static;

    async fn attempt(&self, chunk: &PlannedChunk) -> TransferResult<Self::Output>;
}

struct ChunkDone<O> {
    position: u32,
    output: O,
}

/// Runs chunk transfers on a fixed set of workers fed through a bounded queue
pub struct Dispatcher<T: ChunkTransfer> {
    transfer: Arc<T>,
    governor: Arc<ExecutionGovernor>,
    policy: Arc<dyn RetryPolicy>,
    state: Arc<TransferState>,
    parallelism: usize,
}

impl<T: ChunkTransfer> Dispatcher<T> {
    pub fn new(
        transfer: T,
        governor: Arc<ExecutionGovernor>,
        policy: Arc<dyn RetryPolicy>,
        parallelism: usize,
    ) -> Self {
        Self {
            transfer: Arc::new(transfer),
            governor,
            policy,
            state: Arc::new(TransferState::new()),
            parallelism: parallelism.max(1),
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    /// Read every chunk from `reader`, transfer them with at most `parallelism`
    /// in flight, and return the outputs in chunk order.
    ///
    /// After the first failure no further chunk is started; chunks already in
    /// flight run to completion and the lowest-position failure is reported.
    pub async fn run(&self, reader: &mut ChunkReader) -> TransferResult<Vec<T::Output>> {
        let (job_tx, job_rx) = mpsc::channel::<PlannedChunk>(self.parallelism);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<ChunkDone<T::Output>>();

        let workers: Vec<JoinHandle<()>> = (0..self.parallelism)
            .map(|worker| self.spawn_worker(worker, job_rx.clone(), done_tx.clone()))
            .collect();
        drop(done_tx);

        while !self.state.has_failed() {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    if job_tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(position = reader.chunks_read(), "Reading source failed: {}", e);
                    self.state.record_failure(reader.chunks_read(), e);
                    break;
                }
            }
        }
        drop(job_tx);

        for handle in workers {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }

        if let Some(failure) = self.state.take_failure() {
            warn!(
                position = failure.position,
                completed = self.state.completed_chunks(),
                "Abandoning transfer: {}",
                failure.error
            );
            return Err(failure.error);
        }

        let mut done = Vec::with_capacity(reader.chunks_read() as usize);
        while let Some(chunk) = done_rx.recv().await {
            done.push(chunk);
        }
        done.sort_by_key(|c| c.position);
        debug!(
            chunks = done.len(),
            bytes = self.state.transferred_bytes(),
            elapsed = ?self.state.elapsed(),
            "All chunks transferred"
        );
        Ok(done.into_iter().map(|c| c.output).collect())
    }

    fn spawn_worker(
        &self,
        worker: usize,
        jobs: Arc<Mutex<mpsc::Receiver<PlannedChunk>>>,
        done: mpsc::UnboundedSender<ChunkDone<T::Output>>,
    ) -> JoinHandle<()> {
        let transfer = self.transfer.clone();
        let governor = self.governor.clone();
        let policy = self.policy.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                let next = jobs.lock().await.recv().await;
                let Some(chunk) = next else { break };
                if state.has_failed() {
                    // Drain the queue without starting anything new
                    continue;
                }

                debug!(
                    worker,
                    position = chunk.position,
                    bytes = chunk.data.len(),
                    "Transferring chunk"
                );
                let outcome =
                    run_with_retry(&governor, policy.as_ref(), || transfer.attempt(&chunk)).await;
                match outcome {
                    Ok(output) => {
                        state.record_success(chunk.data.len() as u64);
                        let _ = done.send(ChunkDone { position: chunk.position, output });
                    }
                    Err(failure) => {
                        let error = if failure.error.is_terminal() {
                            failure.error
                        } else {
                            TransferError::Aggregate {
                                position: chunk.position,
                                attempts: failure.attempts,
                                source: Box::new(failure.error),
                            }
                        };
                        state.record_failure(chunk.position, error);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::{plan, UploadSource};
    use crate::retry::ExponentialRetry;
    use crate::{ProtocolCode, TransferOptions};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records each chunk's first byte; fails positions listed in `broken`
    struct Probe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
        broken: HashSet<u32>,
        started: parking_lot::Mutex<Vec<u32>>,
    }

    impl Probe {
        fn new(delay: Duration, broken: &[u32]) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
                broken: broken.iter().copied().collect(),
                started: parking_lot::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChunkTransfer for Arc<Probe> {
        type Output = u8;

        async fn attempt(&self, chunk: &PlannedChunk) -> TransferResult<u8> {
            self.started.lock().push(chunk.position);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // Later chunks finish first
            let delay = self.delay.saturating_sub(Duration::from_millis(chunk.position as u64));
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.broken.contains(&chunk.position) {
                return Err(TransferError::protocol(ProtocolCode::InvalidBlockId, "bad"));
            }
            Ok(chunk.data[0])
        }
    }

    async fn dispatch(
        content: Vec<u8>,
        parallelism: usize,
        probe: Arc<Probe>,
    ) -> TransferResult<Vec<u8>> {
        let options = TransferOptions::new()
            .with_stream_write_size(1)
            .with_single_blob_upload_threshold(0)
            .with_parallelism(parallelism);
        let source = UploadSource::from_bytes(content);
        let plan = plan(&source, &options).unwrap();
        let mut reader = ChunkReader::new(source, &plan, &options);

        let dispatcher = Dispatcher::new(
            probe,
            Arc::new(ExecutionGovernor::unbounded()),
            Arc::new(ExponentialRetry::new(3, Duration::ZERO)),
            plan.parallelism,
        );
        dispatcher.run(&mut reader).await
    }

    #[tokio::test]
    async fn outputs_follow_position_not_completion() {
        let probe = Arc::new(Probe::new(Duration::from_millis(10), &[]));
        let content: Vec<u8> = (0..8).collect();

        let outputs = dispatch(content.clone(), 4, probe.clone()).await.unwrap();

        assert_eq!(outputs, content);
        let peak = probe.peak.load(Ordering::SeqCst);
        assert!(peak <= 4 && peak >= 2, "peak concurrency {}", peak);
    }

    #[tokio::test]
    async fn reports_earliest_failure_and_stops_scheduling() {
        let probe = Arc::new(Probe::new(Duration::from_millis(5), &[1, 3]));
        let content: Vec<u8> = (0..50).collect();

        let err = dispatch(content, 2, probe.clone()).await.unwrap_err();

        match err {
            TransferError::Aggregate { position, attempts, source } => {
                assert_eq!(position, 1);
                assert_eq!(attempts, 1);
                assert_eq!(source.protocol_code(), Some(ProtocolCode::InvalidBlockId));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(probe.started.lock().len() < 50);
    }
}
