//! Bundling scheduler behind the batch message handler.
//!
//! Messages accumulate in the current bundle until it reaches the count or
//! byte threshold, or until the delay threshold has passed since its first
//! message. A flushed bundle is handed to the batch handler on its own task;
//! at most `concurrency` bundles are handled at once. Every submitter waits on
//! a oneshot channel for its own message's outcome.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::error::BatchError;
use super::handler::SharedBatchHandler;
use crate::error::{panic_message, Error, SharedError};
use crate::types::{BatchMessageHandlerConfig, Message};

type Outcome = anyhow::Result<()>;

struct PendingItem {
    message: Message,
    result: oneshot::Sender<Outcome>,
}

struct Bundle {
    id: u64,
    items: Vec<PendingItem>,
    bytes: usize,
}

impl Bundle {
    fn new(id: u64) -> Self {
        Self {
            id,
            items: Vec::new(),
            bytes: 0,
        }
    }
}

struct State {
    current: Bundle,
    next_bundle_id: u64,
    /// Bytes accepted but not yet handled, across all bundles.
    buffered_bytes: usize,
    closed: bool,
}

impl State {
    fn take_current(&mut self) -> Bundle {
        let id = self.next_bundle_id;
        self.next_bundle_id += 1;
        std::mem::replace(&mut self.current, Bundle::new(id))
    }
}

struct Inner {
    config: BatchMessageHandlerConfig,
    handler: SharedBatchHandler,
    state: Mutex<State>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    /// Cancels pending delay timers on shutdown.
    closing: CancellationToken,
}

/// Groups submitted messages into bundles and hands them to a batch handler.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    /// Create a scheduler. Zero config fields take defaults.
    pub fn new(handler: SharedBatchHandler, config: BatchMessageHandlerConfig) -> Self {
        let config = config.with_defaults();
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                state: Mutex::new(State {
                    current: Bundle::new(0),
                    next_bundle_id: 1,
                    buffered_bytes: 0,
                    closed: false,
                }),
                permits: Arc::new(Semaphore::new(config.concurrency)),
                tasks: TaskTracker::new(),
                closing: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BatchMessageHandlerConfig {
        &self.inner.config
    }

    /// Enqueue a message and wait until its bundle has been handled.
    ///
    /// Fails immediately with [`Error::OversizedItem`] if the message alone
    /// exceeds the buffered byte limit, [`Error::BufferFull`] if accepting it
    /// would exceed that limit, or [`Error::SchedulerClosed`] after shutdown.
    pub async fn submit(&self, message: Message) -> anyhow::Result<()> {
        let rx = self.inner.add(message)?;
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::SchedulerClosed.into()),
        }
    }

    /// Bytes accepted and not yet handled.
    pub fn buffered_bytes(&self) -> usize {
        self.inner.state().buffered_bytes
    }

    /// Messages waiting in the current, unflushed bundle.
    pub fn pending_len(&self) -> usize {
        self.inner.state().current.items.len()
    }

    /// Stop accepting messages, flush the current bundle and wait for every
    /// in-flight bundle to finish.
    pub async fn shutdown(&self) {
        let pending = {
            let mut state = self.inner.state();
            state.closed = true;
            if state.current.items.is_empty() {
                None
            } else {
                Some(state.take_current())
            }
        };
        self.inner.closing.cancel();
        if let Some(bundle) = pending {
            self.inner.dispatch(bundle);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(self: &Arc<Self>, message: Message) -> Result<oneshot::Receiver<Outcome>, Error> {
        let size = message.encoded_len();
        let limit = self.config.buffered_byte_limit;
        if size > limit {
            return Err(Error::OversizedItem { size, limit });
        }

        let (tx, rx) = oneshot::channel();
        let mut ready = Vec::new();
        {
            let mut state = self.state();
            if state.closed {
                return Err(Error::SchedulerClosed);
            }
            if state.buffered_bytes + size > limit {
                return Err(Error::BufferFull {
                    buffered: state.buffered_bytes,
                    size,
                    limit,
                });
            }

            // Never let a bundle grow past the byte threshold; an item that
            // is itself over the threshold ends up alone in its bundle.
            if !state.current.items.is_empty()
                && state.current.bytes + size > self.config.byte_threshold
            {
                ready.push(state.take_current());
            }
            if state.current.items.is_empty() {
                self.start_timer(state.current.id);
            }

            state.buffered_bytes += size;
            state.current.bytes += size;
            state.current.items.push(PendingItem {
                message,
                result: tx,
            });

            if state.current.items.len() >= self.config.count_threshold
                || state.current.bytes >= self.config.byte_threshold
            {
                ready.push(state.take_current());
            }
        }

        for bundle in ready {
            self.dispatch(bundle);
        }
        Ok(rx)
    }

    fn start_timer(self: &Arc<Self>, bundle_id: u64) {
        let inner = Arc::clone(self);
        let delay = self.config.delay_threshold;
        let closing = self.closing.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => inner.flush_bundle(bundle_id),
                _ = closing.cancelled() => {}
            }
        });
    }

    /// Flush the current bundle if it is still the one the timer was armed for.
    fn flush_bundle(self: &Arc<Self>, bundle_id: u64) {
        let bundle = {
            let mut state = self.state();
            if state.current.id != bundle_id || state.current.items.is_empty() {
                return;
            }
            state.take_current()
        };
        self.dispatch(bundle);
    }

    fn dispatch(self: &Arc<Self>, bundle: Bundle) {
        let inner = Arc::clone(self);
        self.tasks.spawn(async move {
            let _permit = inner.permits.clone().acquire_owned().await.ok();
            let bytes = bundle.bytes;
            inner.handle_bundle(bundle).await;
            inner.release(bytes);
        });
    }

    async fn handle_bundle(&self, bundle: Bundle) {
        let bundle_id = bundle.id;
        let count = bundle.items.len();
        let mut messages = Vec::with_capacity(count);
        let mut waiters = Vec::with_capacity(count);
        for item in bundle.items {
            waiters.push((item.message.id.clone(), item.result));
            messages.push(item.message);
        }

        let started = Instant::now();
        let outcome = match AssertUnwindSafe(self.handler.handle_batch(messages))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let panic = panic_message(&*payload);
                warn!(bundle_id, count, panic = %panic, "batch handler panicked");
                Err(Error::BatchPanicked { count, panic }.into())
            }
        };
        debug!(
            bundle_id,
            count,
            bytes = bundle.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            success = outcome.is_ok(),
            "Handled batch"
        );

        match outcome {
            Ok(()) => {
                for (_, tx) in waiters {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(err) => match err.downcast::<BatchError>() {
                Ok(failures) => deliver_keyed(waiters, failures.into_shared()),
                Err(err) => {
                    let shared = SharedError::new(err);
                    for (_, tx) in waiters {
                        let _ = tx.send(Err(shared.to_anyhow()));
                    }
                }
            },
        }
    }

    fn release(&self, bytes: usize) {
        let mut state = self.state();
        state.buffered_bytes = state.buffered_bytes.saturating_sub(bytes);
    }
}

fn deliver_keyed(
    waiters: Vec<(String, oneshot::Sender<Outcome>)>,
    failures: HashMap<String, SharedError>,
) {
    for (id, tx) in waiters {
        let outcome = match failures.get(&id) {
            Some(err) => Err(err.to_anyhow()),
            None => Ok(()),
        };
        let _ = tx.send(outcome);
    }
}
