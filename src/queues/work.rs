//! A bounded pool of async workers.
//!
//! This is a strictly "in process" pool meant for closely-related subtasks of
//! one larger job. At most `worker_count` work items run at any one time.
//! Submitting an item returns a one-shot [`oneshot::Receiver`], which callers
//! can await in whatever order they like. This lets the caller decide the
//! order in which results are consumed, independently of the order in which
//! they actually finish.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};
use tokio::task::JoinHandle;

use crate::{async_utils::BoxedFuture, prelude::*};

/// A unit of work waiting for a worker, plus the channel on which to return
/// its result.
struct PoolItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Output>,
}

/// An async work function. Failures must be represented in `Output`.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Output> + Send + Sync + 'static>;

/// A fixed number of workers sharing a single work function.
pub struct WorkerPool<Input, Output> {
    /// Queue for submitting work items.
    tx: mpsc::Sender<PoolItem<Input, Output>>,

    /// The background task which hands items to workers.
    worker_handle: JoinHandle<()>,
}

impl<Input, Output> WorkerPool<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Start a pool of `worker_count` workers running `work_fn`.
    ///
    /// This must be called from inside a Tokio runtime.
    pub fn new(worker_count: usize, work_fn: WorkFn<Input, Output>) -> Self {
        let worker_count = worker_count.max(1);
        let (tx, rx) = mpsc::channel(worker_count);
        let worker_handle = tokio::spawn(async move {
            rx.for_each_concurrent(worker_count, |item: PoolItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let output = work_fn(item.input).await;
                    if item.tx.send(output).is_err() {
                        debug!("dropping work item result because receiver was dropped");
                    }
                }
            })
            .await;
        });
        Self { tx, worker_handle }
    }

    /// Submit an input, and return a channel that will receive the output.
    ///
    /// This only waits if the pool's queue is full.
    pub async fn submit(&self, input: Input) -> Result<oneshot::Receiver<Output>> {
        let (tx, rx) = oneshot::channel();
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut sender = self.tx.clone();
        sender
            .send(PoolItem { input, tx })
            .await
            .context("failed to send work item")?;
        Ok(rx)
    }

    /// Close the pool and wait for any queued work to finish.
    pub async fn close(self) -> Result<()> {
        let Self { tx, worker_handle } = self;
        drop(tx);
        worker_handle
            .await
            .context("failed to join worker pool task")?;
        Ok(())
    }
}
