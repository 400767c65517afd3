//! Paginated, rate-limit aware fetching of one resource page per queue task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use basesync_core::{total_records, CycleResult, ResourceKeyFn, ResourceSpec, StatusKind};
use basesync_storage::{Transport, TransportError};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::{debug, info_span, warn, Instrument};

use crate::feed::StatusFeed;
use crate::queue::RateLimitedQueue;
use crate::SyncError;

pub const RATE_LIMITED_STATUS: u16 = 429;
pub const OFFSET_PARAM: &str = "offset";
pub const FILTER_PARAM: &str = "filterByFormula";

/// One scheduled page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTask {
    pub resource: Arc<ResourceSpec>,
    pub page: u32,
    pub offset: Option<String>,
    /// Number of rate-limited attempts that preceded this one.
    pub retries: u32,
}

impl PageTask {
    pub fn first(resource: Arc<ResourceSpec>) -> Self {
        Self {
            resource,
            page: 1,
            offset: None,
            retries: 0,
        }
    }

    pub fn next_page(&self, offset: String) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            page: self.page + 1,
            offset: Some(offset),
            retries: 0,
        }
    }

    /// Same page and token, scheduled again.
    pub fn retry(&self) -> Self {
        Self {
            retries: self.retries + 1,
            ..self.clone()
        }
    }
}

/// What a page request leaves behind for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// No continuation token; the resource is done for this cycle.
    Complete,
    NextPage(PageTask),
    RateLimited(PageTask),
}

/// `IS_AFTER(LAST_MODIFIED_TIME(), '<cursor>')`
pub fn modified_after_formula(cursor: DateTime<Utc>) -> String {
    format!(
        "IS_AFTER(LAST_MODIFIED_TIME(), '{}')",
        cursor.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Base query, then the continuation token, then the cursor filter; later
/// entries win on key collisions.
pub fn build_query(
    resource: &ResourceSpec,
    offset: Option<&str>,
    cursor: Option<DateTime<Utc>>,
) -> BTreeMap<String, String> {
    let mut query = resource.query.clone();
    if let Some(offset) = offset {
        query.insert(OFFSET_PARAM.to_string(), offset.to_string());
    }
    if let Some(cursor) = cursor {
        query.insert(FILTER_PARAM.to_string(), modified_after_formula(cursor));
    }
    query
}

/// Per-cycle fetch context shared by every page task of the cycle.
pub struct PageFetcher {
    transport: Arc<dyn Transport>,
    queue: RateLimitedQueue<SyncError>,
    feed: Arc<StatusFeed>,
    keys: ResourceKeyFn,
    cursor: Option<DateTime<Utc>>,
    rate_limit_delay: Duration,
    results: Mutex<CycleResult>,
}

impl PageFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: RateLimitedQueue<SyncError>,
        feed: Arc<StatusFeed>,
        keys: ResourceKeyFn,
        cursor: Option<DateTime<Utc>>,
        rate_limit_delay: Duration,
    ) -> Self {
        Self {
            transport,
            queue,
            feed,
            keys,
            cursor,
            rate_limit_delay,
            results: Mutex::new(CycleResult::new()),
        }
    }

    /// Schedules `task` on the shared queue.
    pub fn enqueue(self: &Arc<Self>, task: PageTask) {
        let this = Arc::clone(self);
        self.queue.add(async move { this.run(task).await });
    }

    async fn run(self: Arc<Self>, task: PageTask) -> Result<(), SyncError> {
        match self.fetch_page(&task).await? {
            PageOutcome::Complete => Ok(()),
            PageOutcome::NextPage(next) => {
                self.enqueue(next);
                Ok(())
            }
            PageOutcome::RateLimited(retry) => {
                self.wait_out_rate_limit(retry).await;
                Ok(())
            }
        }
    }

    /// Pauses the whole queue, waits, then re-issues the page as a new task.
    async fn wait_out_rate_limit(self: &Arc<Self>, retry: PageTask) {
        let resumes_at = Utc::now()
            + chrono::Duration::from_std(self.rate_limit_delay).unwrap_or(chrono::Duration::zero());
        self.feed.transition(StatusKind::RateLimited { resumes_at });
        self.queue.pause();
        warn!(
            resource = %retry.resource.name,
            page = retry.page,
            delay = ?self.rate_limit_delay,
            "rate limited; pausing queue"
        );

        tokio::time::sleep(self.rate_limit_delay).await;

        debug!(resource = %retry.resource.name, page = retry.page, "requeuing page");
        self.enqueue(retry);
        self.feed.transition(StatusKind::Fetching);
        self.queue.start();
    }

    /// Issues one page request and records its records.
    pub async fn fetch_page(&self, task: &PageTask) -> Result<PageOutcome, SyncError> {
        let span = info_span!(
            "fetch_page",
            resource = %task.resource.name,
            page = task.page,
            retries = task.retries
        );
        self.fetch_page_inner(task).instrument(span).await
    }

    async fn fetch_page_inner(&self, task: &PageTask) -> Result<PageOutcome, SyncError> {
        let resource = &task.resource;
        let query = build_query(resource, task.offset.as_deref(), self.cursor);
        debug!(?query, cursor = ?self.cursor, "requesting page");

        let page = match self.transport.list_records(&resource.name, &query).await {
            Ok(page) => page,
            Err(TransportError::Status {
                status: RATE_LIMITED_STATUS,
                ..
            }) => return Ok(PageOutcome::RateLimited(task.retry())),
            Err(TransportError::Status { status, body }) => {
                self.queue.clear();
                return Err(SyncError::Status {
                    resource: resource.name.clone(),
                    page: task.page,
                    status,
                    body,
                });
            }
            Err(err) => return Err(SyncError::Transport(err)),
        };

        let received = page.records.len();
        let key = self.keys.key_for(&resource.name);
        {
            let mut results = self.results.lock();
            results.entry(key).or_default().extend(page.records);
            self.feed.progress(total_records(&results));
        }

        match page.offset {
            Some(offset) => {
                debug!(received, "queuing next page");
                Ok(PageOutcome::NextPage(task.next_page(offset)))
            }
            None => {
                debug!(received, "resource complete");
                Ok(PageOutcome::Complete)
            }
        }
    }

    /// Takes the records accumulated so far, leaving an empty result behind.
    pub fn take_results(&self) -> CycleResult {
        std::mem::take(&mut *self.results.lock())
    }
}
