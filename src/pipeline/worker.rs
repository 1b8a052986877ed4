//! Bounded batch queue and the consumer thread that drains it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, SendTimeoutError, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error};

use super::PipelineShared;
use crate::error::{PipelineError, Result};
use crate::frame::DeferredBatch;

/// How often a blocking push re-checks for shutdown.
const PUSH_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A rejected push. The item is handed back.
#[derive(Debug, Error)]
pub enum PushError<T> {
    #[error("queue is full")]
    Full(T),
    #[error("queue is shut down")]
    Shutdown(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Shutdown(item) => item,
        }
    }
}

/// Fixed-capacity FIFO between one producer and one consumer.
///
/// After [`request_shutdown`](Self::request_shutdown) pushes fail, and pops
/// drain what is left before reporting the queue closed.
pub struct BoundedQueue<T> {
    sender: Sender<T>,
    receiver: Receiver<T>,
    wake_sender: Sender<()>,
    wake_receiver: Receiver<()>,
    shutdown: AtomicBool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity.max(1));
        let (wake_sender, wake_receiver) = bounded(1);
        Self {
            sender,
            receiver,
            wake_sender,
            wake_receiver,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Push without blocking.
    pub fn push(&self, item: T) -> std::result::Result<(), PushError<T>> {
        if self.is_shutdown() {
            return Err(PushError::Shutdown(item));
        }
        self.sender.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => PushError::Full(item),
            TrySendError::Disconnected(item) => PushError::Shutdown(item),
        })
    }

    /// Push, waiting for room. Only fails once the queue shuts down.
    pub fn push_blocking(&self, mut item: T) -> std::result::Result<(), PushError<T>> {
        loop {
            if self.is_shutdown() {
                return Err(PushError::Shutdown(item));
            }
            match self.sender.send_timeout(item, PUSH_POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Disconnected(returned)) => {
                    return Err(PushError::Shutdown(returned))
                }
            }
        }
    }

    /// Wait for the next item. `None` once the queue is shut down and empty.
    pub fn pop_blocking(&self) -> Option<T> {
        loop {
            if let Ok(item) = self.receiver.try_recv() {
                return Some(item);
            }
            if self.is_shutdown() {
                return None;
            }
            select! {
                recv(self.receiver) -> item => {
                    if let Ok(item) = item {
                        return Some(item);
                    }
                }
                recv(self.wake_receiver) -> _ => {}
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // A full wake channel already holds a pending wake-up.
        let _ = self.wake_sender.try_send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// The consumer thread plus the queue feeding it.
pub(crate) struct BatchWorker {
    queue: Arc<BoundedQueue<DeferredBatch>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl BatchWorker {
    pub(crate) fn spawn(shared: Arc<PipelineShared>, capacity: usize) -> Result<Self> {
        let queue = Arc::new(BoundedQueue::new(capacity));
        let handle = thread::Builder::new()
            .name("encode-consumer".to_string())
            .spawn({
                let queue = Arc::clone(&queue);
                move || consume(&shared, &queue)
            })?;
        debug!("Started consumer thread, queue capacity {}", capacity);
        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    pub(crate) fn queue(&self) -> &BoundedQueue<DeferredBatch> {
        &self.queue
    }

    /// Shut the queue down, wait for the consumer and return its result.
    pub(crate) fn join(&mut self) -> Result<()> {
        self.queue.request_shutdown();
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                PipelineError::Synchronization("consumer thread panicked".to_string())
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for BatchWorker {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            error!("Consumer thread failed during shutdown: {}", err);
        }
    }
}

/// Consumer loop. After the first failure the remaining batches are only
/// released.
fn consume(shared: &PipelineShared, queue: &BoundedQueue<DeferredBatch>) -> Result<()> {
    let mut first_error = None;
    while let Some(batch) = queue.pop_blocking() {
        if first_error.is_some() {
            shared.release_batch(batch);
            continue;
        }
        if let Err(err) = shared.process_batch(batch) {
            error!("Batch failed on the consumer thread: {}", err);
            queue.request_shutdown();
            first_error = Some(err);
        }
    }
    debug!("Consumer thread finished");
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_third_push_fails_until_pop() {
        let queue = BoundedQueue::new(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        match queue.push(3) {
            Err(PushError::Full(item)) => assert_eq!(item, 3),
            other => panic!("expected a full queue, got {other:?}"),
        }

        assert_eq!(queue.pop_blocking(), Some(1));
        queue.push(3).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_shutdown_drains_then_closes() {
        let queue = BoundedQueue::new(2);
        queue.push("a").unwrap();
        queue.request_shutdown();

        assert!(matches!(queue.push("b"), Err(PushError::Shutdown("b"))));
        assert_eq!(queue.pop_blocking(), Some("a"));
        assert_eq!(queue.pop_blocking(), None);
    }

    #[test]
    fn test_shutdown_wakes_a_waiting_consumer() {
        let queue = Arc::new(BoundedQueue::<u32>::new(1));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking())
        };
        thread::sleep(Duration::from_millis(20));
        queue.request_shutdown();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_blocking_push_waits_for_room() {
        let queue = Arc::new(BoundedQueue::new(1));
        queue.push(1).unwrap();
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push_blocking(2).map_err(PushError::into_inner))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(queue.pop_blocking(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop_blocking(), Some(2));
    }

    #[test]
    fn test_blocking_push_gives_up_on_shutdown() {
        let queue = BoundedQueue::new(1);
        queue.push(1).unwrap();
        queue.request_shutdown();
        assert!(matches!(queue.push_blocking(2), Err(PushError::Shutdown(2))));
    }
}
