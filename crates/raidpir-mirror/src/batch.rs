//! Batch mode: accumulate expanded masks, answer them in one kernel pass.
//!
//! Request handlers append masks to a shared accumulator and signal the
//! batch-answer task. The task swaps the accumulator out under the lock,
//! runs one `produce_xor_multiple` over everything collected, and writes the
//! replies in arrival order — the client relies on FIFO replies. Teardown
//! raises the finish flag and signals once more; the task drains whatever is
//! left before exiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use raidpir_core::codec;
use raidpir_core::wire::{self, ChunkMap};
use raidpir_store::XorDatastore;

#[derive(Default)]
struct Accumulator {
    masks: Vec<u8>,
    requests: usize,
}

struct BatchQueue {
    accumulator: Mutex<Accumulator>,
    notify: Notify,
    finish: AtomicBool,
}

pub struct BatchHandle {
    queue: Arc<BatchQueue>,
    task: JoinHandle<()>,
}

impl BatchHandle {
    /// Spawn the batch-answer task for one session.
    ///
    /// `chunk_numbers` is `Some(cn)` for parallel sessions, where each
    /// request contributes one mask per covered chunk and the reply is a
    /// chunk-index → block map.
    pub fn spawn<W>(
        store: Arc<XorDatastore>,
        writer: Arc<Mutex<W>>,
        chunk_numbers: Option<Vec<u32>>,
        compute_time: Arc<Mutex<f64>>,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let queue = Arc::new(BatchQueue {
            accumulator: Mutex::new(Accumulator::default()),
            notify: Notify::new(),
            finish: AtomicBool::new(false),
        });
        let task = tokio::spawn(batch_answer(
            store,
            writer,
            chunk_numbers,
            compute_time,
            queue.clone(),
        ));
        Self { queue, task }
    }

    /// Append one request's expanded mask(s) and wake the task.
    pub async fn append(&self, masks: &[u8]) {
        {
            let mut accumulator = self.queue.accumulator.lock().await;
            accumulator.masks.extend_from_slice(masks);
            accumulator.requests += 1;
        }
        self.queue.notify.notify_one();
    }

    /// Tell the task to drain and exit, then wait for it.
    pub async fn shutdown(self) {
        self.queue.finish.store(true, Ordering::SeqCst);
        self.queue.notify.notify_one();
        let _ = self.task.await;
    }
}

async fn batch_answer<W>(
    store: Arc<XorDatastore>,
    writer: Arc<Mutex<W>>,
    chunk_numbers: Option<Vec<u32>>,
    compute_time: Arc<Mutex<f64>>,
    queue: Arc<BatchQueue>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let masks_per_request = chunk_numbers.as_ref().map_or(1, |cn| cn.len());
    let block_size = store.block_size();

    loop {
        let (masks, requests) = {
            let mut accumulator = queue.accumulator.lock().await;
            (
                std::mem::take(&mut accumulator.masks),
                std::mem::replace(&mut accumulator.requests, 0),
            )
        };

        if requests == 0 {
            if queue.finish.load(Ordering::SeqCst) {
                return;
            }
            queue.notify.notified().await;
            continue;
        }

        let started = Instant::now();
        let answer = match store.produce_xor_multiple(&masks, requests * masks_per_request) {
            Ok(answer) => answer,
            Err(err) => {
                // handlers validated every mask before appending
                tracing::error!(error = %err, "batch kernel failed, dropping session replies");
                return;
            }
        };
        *compute_time.lock().await += started.elapsed().as_secs_f64();

        let mut writer = writer.lock().await;
        let mut blocks = answer.chunks_exact(block_size);
        for _ in 0..requests {
            let reply = match &chunk_numbers {
                None => blocks.next().expect("kernel output length").to_vec(),
                Some(cn) => {
                    let mut result = ChunkMap::new();
                    for &c in cn {
                        result.insert(c, blocks.next().expect("kernel output length").to_vec());
                    }
                    match codec::encode(&result) {
                        Ok(encoded) => encoded,
                        Err(err) => {
                            tracing::error!(error = %err, "cannot encode batch reply");
                            return;
                        }
                    }
                }
            };
            if let Err(err) = wire::send_message(&mut *writer, &reply).await {
                tracing::warn!(error = %err, "batch reply failed, session is gone");
                return;
            }
        }
    }
}
