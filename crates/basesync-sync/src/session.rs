//! Cycle controller: fetch every resource, merge, transform.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use basesync_core::{
    merge_cycle, newest_modified_date, CollapsedEntry, CycleCounts, ResourceKeyFn, ResourceSpec,
    Snapshot, StatusEvent, StatusKind, StatusLog,
};
use basesync_storage::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::feed::{StatusFeed, SyncEvent};
use crate::fetcher::{PageFetcher, PageTask};
use crate::queue::RateLimitedQueue;
use crate::{ConfigError, SyncConfig, SyncError};

/// Derives the caller's value from the merged snapshot.
#[async_trait]
pub trait Transform: Send + Sync {
    type Output: Clone + Send + Sync + 'static;

    async fn transform(&self, snapshot: &Snapshot) -> anyhow::Result<Self::Output>;
}

/// Hands back the snapshot itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

#[async_trait]
impl Transform for IdentityTransform {
    type Output = Snapshot;

    async fn transform(&self, snapshot: &Snapshot) -> anyhow::Result<Snapshot> {
        Ok(snapshot.clone())
    }
}

/// Everything needed to resume a session after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState<O> {
    pub log: Vec<StatusEvent>,
    pub last_parsed: Option<O>,
    pub from_date: Option<DateTime<Utc>>,
    pub previous_fetch: Snapshot,
}

impl<O> Default for SessionState<O> {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            last_parsed: None,
            from_date: None,
            previous_fetch: Snapshot::new(),
        }
    }
}

/// Requests a reset from anywhere; it is consumed when the next cycle starts.
#[derive(Debug, Clone)]
pub struct ResetHandle {
    requested: Arc<AtomicBool>,
    feed: Arc<StatusFeed>,
}

impl ResetHandle {
    pub fn request_reset(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.feed.transition(StatusKind::Reset);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Owns the snapshot, cursor and status of one synchronized base.
///
/// [`SyncSession::run_cycle`] takes `&mut self`, so at most one cycle per
/// session can be in flight.
pub struct SyncSession<T: Transform> {
    config: SyncConfig,
    resources: Vec<Arc<ResourceSpec>>,
    keys: ResourceKeyFn,
    transport: Arc<dyn Transport>,
    transform: T,
    queue: RateLimitedQueue<SyncError>,
    feed: Arc<StatusFeed>,
    reset: ResetHandle,
    snapshot: Snapshot,
    cursor: Option<DateTime<Utc>>,
    last_parsed: Option<T::Output>,
}

impl<T: Transform> SyncSession<T> {
    pub fn new(
        config: SyncConfig,
        resources: Vec<ResourceSpec>,
        transport: Arc<dyn Transport>,
        transform: T,
    ) -> Result<Self, ConfigError> {
        Self::restore(config, resources, transport, transform, SessionState::default())
    }

    pub fn restore(
        config: SyncConfig,
        resources: Vec<ResourceSpec>,
        transport: Arc<dyn Transport>,
        transform: T,
        state: SessionState<T::Output>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let feed = Arc::new(StatusFeed::new(StatusLog::restore(state.log)));
        feed.transition(StatusKind::Ready);

        Ok(Self {
            queue: RateLimitedQueue::new(config.queue_limits()),
            config,
            resources: resources.into_iter().map(Arc::new).collect(),
            keys: ResourceKeyFn::default(),
            transport,
            transform,
            reset: ResetHandle {
                requested: Arc::new(AtomicBool::new(false)),
                feed: Arc::clone(&feed),
            },
            feed,
            snapshot: state.previous_fetch,
            cursor: state.from_date,
            last_parsed: state.last_parsed,
        })
    }

    pub fn with_key_fn(mut self, keys: ResourceKeyFn) -> Self {
        self.keys = keys;
        self
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
        self.feed.subscribe()
    }

    pub fn reset_handle(&self) -> ResetHandle {
        self.reset.clone()
    }

    pub fn request_reset(&self) {
        self.reset.request_reset();
    }

    pub fn status(&self) -> Option<StatusEvent> {
        self.feed.current()
    }

    pub fn log(&self) -> Vec<StatusEvent> {
        self.feed.log()
    }

    pub fn collapsed_log(&self) -> Vec<CollapsedEntry> {
        self.feed.collapsed()
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        self.cursor
    }

    pub fn last_parsed(&self) -> Option<&T::Output> {
        self.last_parsed.as_ref()
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.resources.iter().map(|r| &**r)
    }

    pub fn export_state(&self) -> SessionState<T::Output> {
        SessionState {
            log: self.feed.log(),
            last_parsed: self.last_parsed.clone(),
            from_date: self.cursor,
            previous_fetch: self.snapshot.clone(),
        }
    }

    /// Runs one fetch → merge → transform cycle.
    ///
    /// Fatal errors are recorded as `errored` before being returned. The
    /// transform only runs when the cycle changed something or no transform
    /// has succeeded yet; otherwise the previous output is returned.
    pub async fn run_cycle(&mut self) -> Result<T::Output, SyncError> {
        self.feed.transition(StatusKind::Fetching);

        if self.reset.requested.swap(false, Ordering::SeqCst) {
            info!("reset requested; discarding snapshot and cursor");
            self.snapshot.clear();
            self.cursor = None;
        }

        match self.execute().await {
            Ok((output, counts)) => {
                info!(
                    created = counts.created_count,
                    updated = counts.updated_count,
                    cursor = ?self.cursor,
                    "sync cycle complete"
                );
                Ok(output)
            }
            Err(err) => {
                self.queue.clear();
                let report = err.report();
                error!(error = %err, when = ?report.when, "sync cycle failed");
                self.feed.transition(StatusKind::Errored { err: report });
                Err(err)
            }
        }
    }

    async fn execute(&mut self) -> Result<(T::Output, CycleCounts), SyncError> {
        // A previous cycle may have failed while the queue was paused.
        self.queue.start();

        let fetcher = Arc::new(PageFetcher::new(
            Arc::clone(&self.transport),
            self.queue.clone(),
            Arc::clone(&self.feed),
            self.keys.clone(),
            self.cursor,
            self.config.rate_limit_delay,
        ));
        for resource in &self.resources {
            fetcher.enqueue(PageTask::first(Arc::clone(resource)));
        }
        self.queue.on_idle().await?;

        let cycle = fetcher.take_results();
        let newest = newest_modified_date(&cycle);
        let counts = merge_cycle(&mut self.snapshot, cycle);

        let reused = if counts.is_empty() {
            self.last_parsed.clone()
        } else {
            None
        };
        let output = match reused {
            Some(previous) => previous,
            None => {
                self.feed.transition(StatusKind::Parsing);
                tokio::time::sleep(self.config.parse_settle_delay).await;
                let output = self
                    .transform
                    .transform(&self.snapshot)
                    .await
                    .map_err(SyncError::Transform)?;
                self.last_parsed = Some(output.clone());
                output
            }
        };

        self.queue.clear();
        self.cursor = Some(match self.cursor {
            Some(previous) if previous > newest => previous,
            _ => newest,
        });
        self.feed.transition(StatusKind::Success(counts));
        self.feed.transition(StatusKind::Idle);
        Ok((output, counts))
    }
}
