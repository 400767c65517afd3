//! Bounded-concurrency, bounded-rate task queue.
//!
//! Tasks are dispatched while a caller is awaiting [`RateLimitedQueue::on_idle`];
//! that call is the scheduler loop. Handles are cheap to clone, so running
//! tasks can enqueue follow-up work which is dispatched before `on_idle`
//! settles.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{error::Elapsed, Instant};

pub type Task<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub concurrency: usize,
    /// Task starts allowed within any rolling `interval`.
    pub interval_cap: usize,
    pub interval: Duration,
    pub task_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum QueueError<E> {
    #[error("{0}")]
    Task(E),
    #[error("task exceeded its {0:?} timeout")]
    Timeout(Duration),
    #[error("task aborted: {0}")]
    Aborted(String),
}

pub struct RateLimitedQueue<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for RateLimitedQueue<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for RateLimitedQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RateLimitedQueue")
            .field("limits", &self.inner.limits)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight)
            .field("paused", &state.paused)
            .finish()
    }
}

struct Inner<E> {
    limits: QueueLimits,
    state: Mutex<State<E>>,
    wake: Notify,
}

struct State<E> {
    pending: VecDeque<Task<E>>,
    paused: bool,
    in_flight: usize,
    /// Start instants within the current rolling window, oldest first.
    starts: VecDeque<Instant>,
}

enum Dispatch {
    Idle,
    Busy { window_reopens: Option<Instant> },
}

type Running<E> = JoinSet<Result<Result<(), E>, Elapsed>>;

impl<E: Send + 'static> RateLimitedQueue<E> {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            inner: Arc::new(Inner {
                limits,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    paused: false,
                    in_flight: 0,
                    starts: VecDeque::new(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> QueueLimits {
        self.inner.limits
    }

    pub fn add<F>(&self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.inner.state.lock().pending.push_back(Box::pin(task));
        self.inner.wake.notify_one();
    }

    /// Stops dispatching new tasks; queued and running tasks are kept.
    pub fn pause(&self) {
        self.inner.state.lock().paused = true;
    }

    pub fn start(&self) {
        self.inner.state.lock().paused = false;
        self.inner.wake.notify_one();
    }

    /// Drops every queued task that has not started yet.
    pub fn clear(&self) {
        self.inner.state.lock().pending.clear();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    /// Runs queued tasks until nothing is queued or running.
    ///
    /// Returns the first task failure. Tasks still running at that point are
    /// aborted; queued tasks stay queued.
    pub async fn on_idle(&self) -> Result<(), QueueError<E>> {
        let mut running: Running<E> = JoinSet::new();
        let _reset = InFlightReset(self.inner.as_ref());

        loop {
            let window_reopens = match self.dispatch(&mut running) {
                Dispatch::Idle => return Ok(()),
                Dispatch::Busy { window_reopens } => window_reopens,
            };

            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.inner.state.lock().in_flight = running.len();
                    match joined {
                        Ok(Ok(Ok(()))) => {}
                        Ok(Ok(Err(err))) => return Err(QueueError::Task(err)),
                        Ok(Err(_)) => return Err(QueueError::Timeout(self.inner.limits.task_timeout)),
                        Err(err) => return Err(QueueError::Aborted(err.to_string())),
                    }
                }
                _ = self.inner.wake.notified() => {}
                _ = sleep_until_some(window_reopens) => {}
            }
        }
    }

    fn dispatch(&self, running: &mut Running<E>) -> Dispatch {
        let limits = self.inner.limits;
        let mut state = self.inner.state.lock();
        let mut window_reopens = None;

        while !state.paused && !state.pending.is_empty() && running.len() < limits.concurrency {
            let now = Instant::now();
            while state
                .starts
                .front()
                .is_some_and(|started| now.duration_since(*started) >= limits.interval)
            {
                state.starts.pop_front();
            }
            if state.starts.len() >= limits.interval_cap {
                window_reopens = state.starts.front().map(|started| *started + limits.interval);
                break;
            }

            let Some(task) = state.pending.pop_front() else {
                break;
            };
            state.starts.push_back(now);
            running.spawn(tokio::time::timeout(limits.task_timeout, task));
        }

        state.in_flight = running.len();
        if running.is_empty() && state.pending.is_empty() {
            Dispatch::Idle
        } else {
            Dispatch::Busy { window_reopens }
        }
    }
}

/// Zeroes the in-flight count when the scheduler loop exits, since dropping
/// the join set aborts whatever was still running.
struct InFlightReset<'a, E>(&'a Inner<E>);

impl<E> Drop for InFlightReset<'_, E> {
    fn drop(&mut self) {
        self.0.state.lock().in_flight = 0;
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
