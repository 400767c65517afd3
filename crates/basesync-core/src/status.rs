use std::collections::VecDeque;
use std::error::Error as StdError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::CycleCounts;

/// Cycle phase an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Fetching,
    Parsing,
}

/// Serializable, loggable form of a fatal cycle error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Phase>,
    /// Messages of the underlying causes, outermost first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ErrorReport {
    pub fn new(message: impl Into<String>, when: Option<Phase>) -> Self {
        Self {
            message: message.into(),
            when,
            chain: Vec::new(),
        }
    }

    pub fn from_error(err: &(dyn StdError + 'static), when: Option<Phase>) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            when,
            chain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum StatusKind {
    Ready,
    Fetching,
    Parsing,
    Success(CycleCounts),
    Errored {
        err: ErrorReport,
    },
    RateLimited {
        #[serde(rename = "resumesAt")]
        resumes_at: DateTime<Utc>,
    },
    Reset,
    Idle,
}

impl StatusKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Fetching => "fetching",
            Self::Parsing => "parsing",
            Self::Success(_) => "success",
            Self::Errored { .. } => "errored",
            Self::RateLimited { .. } => "ratelimited",
            Self::Reset => "reset",
            Self::Idle => "idle",
        }
    }

    fn shown_in_collapsed_view(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Errored { .. } | Self::Reset)
    }

    /// Whether two adjacent entries of the collapsed view fold into one.
    fn folds_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Errored { err: a }, Self::Errored { err: b }) => a.message == b.message,
            (Self::Success(a), Self::Success(b)) => a.is_empty() && b.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub uid: u64,
    pub at: DateTime<Utc>,
    /// Serialized inline as `type` and `data`.
    #[serde(flatten)]
    pub status: StatusKind,
}

/// One row of the collapsed log view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollapsedEntry {
    pub event: StatusEvent,
    /// Number of raw events this entry stands for.
    pub repeat_count: u32,
}

/// Append-only status log, newest event first.
#[derive(Debug, Clone, Default)]
pub struct StatusLog {
    events: VecDeque<StatusEvent>,
    next_uid: u64,
}

impl StatusLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted events (newest first). New uids continue
    /// above the largest restored one.
    pub fn restore(events: Vec<StatusEvent>) -> Self {
        let next_uid = events.iter().map(|e| e.uid + 1).max().unwrap_or(0);
        Self {
            events: events.into(),
            next_uid,
        }
    }

    pub fn record(&mut self, status: StatusKind) -> StatusEvent {
        self.record_at(status, Utc::now())
    }

    pub fn record_at(&mut self, status: StatusKind, at: DateTime<Utc>) -> StatusEvent {
        let event = StatusEvent {
            uid: self.next_uid,
            at,
            status,
        };
        self.next_uid += 1;
        self.events.push_front(event.clone());
        event
    }

    pub fn current(&self) -> Option<&StatusEvent> {
        self.events.front()
    }

    /// Events newest first.
    pub fn events(&self) -> impl Iterator<Item = &StatusEvent> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<StatusEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Display view: only success/errored/reset events, with adjacent
    /// identical errors and adjacent empty successes folded together.
    pub fn collapsed(&self) -> Vec<CollapsedEntry> {
        let mut view: Vec<CollapsedEntry> = Vec::new();
        for event in self
            .events
            .iter()
            .filter(|e| e.status.shown_in_collapsed_view())
        {
            match view.last_mut() {
                Some(last) if last.event.status.folds_with(&event.status) => {
                    last.repeat_count += 1;
                }
                _ => view.push(CollapsedEntry {
                    event: event.clone(),
                    repeat_count: 1,
                }),
            }
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn errored(message: &str) -> StatusKind {
        StatusKind::Errored {
            err: ErrorReport::new(message, Some(Phase::Fetching)),
        }
    }

    #[test]
    fn record_prepends_and_assigns_increasing_uids() {
        let mut log = StatusLog::new();
        let first = log.record(StatusKind::Ready);
        let second = log.record(StatusKind::Fetching);

        assert_eq!(first.uid, 0);
        assert_eq!(second.uid, 1);
        assert_eq!(log.current(), Some(&second));
        let uids: Vec<_> = log.events().map(|e| e.uid).collect();
        assert_eq!(uids, vec![1, 0]);
    }

    #[test]
    fn restored_log_keeps_uids_unique() {
        let mut original = StatusLog::new();
        original.record(StatusKind::Ready);
        original.record(StatusKind::Idle);

        let mut restored = StatusLog::restore(original.to_vec());
        let next = restored.record(StatusKind::Fetching);
        assert_eq!(next.uid, 2);
        assert_eq!(restored.len(), 3);
    }

    #[test]
    fn identical_adjacent_errors_collapse_with_repeat_count() {
        let mut log = StatusLog::new();
        log.record(errored("boom"));
        log.record(StatusKind::Idle);
        log.record(errored("boom"));

        let view = log.collapsed();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].repeat_count, 2);

        log.record(StatusKind::Fetching);
        log.record(errored("boom"));
        let view = log.collapsed();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].repeat_count, 3);
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn different_errors_stay_separate() {
        let mut log = StatusLog::new();
        log.record(errored("boom"));
        log.record(errored("bang"));

        let view = log.collapsed();
        assert_eq!(view.len(), 2);
        assert!(view.iter().all(|e| e.repeat_count == 1));
    }

    #[test]
    fn only_empty_successes_collapse() {
        let mut log = StatusLog::new();
        log.record(StatusKind::Success(CycleCounts::new(0, 0)));
        log.record(StatusKind::Success(CycleCounts::new(0, 0)));
        log.record(StatusKind::Success(CycleCounts::new(2, 1)));
        log.record(StatusKind::Success(CycleCounts::new(2, 1)));
        log.record(StatusKind::Reset);

        let view = log.collapsed();
        let summary: Vec<_> = view
            .iter()
            .map(|e| (e.event.status.name(), e.repeat_count))
            .collect();
        assert_eq!(
            summary,
            vec![("reset", 1), ("success", 1), ("success", 1), ("success", 2)]
        );
    }

    #[test]
    fn collapsed_view_filters_transient_states() {
        let mut log = StatusLog::new();
        log.record(StatusKind::Ready);
        log.record(StatusKind::Fetching);
        log.record(StatusKind::RateLimited {
            resumes_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap(),
        });
        log.record(StatusKind::Parsing);
        log.record(StatusKind::Idle);

        assert!(log.collapsed().is_empty());
    }

    #[test]
    fn status_events_serialize_with_type_and_data() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut log = StatusLog::new();
        let event = log.record_at(StatusKind::Success(CycleCounts::new(3, 0)), at);

        let value = serde_json::to_value(&event).expect("encode");
        assert_eq!(value["uid"], 0);
        assert_eq!(value["type"], "success");
        assert_eq!(value["data"]["totalCount"], 3);
        assert_eq!(value["data"]["createdCount"], 3);
        assert!(value.get("status").is_none());

        let limited = StatusKind::RateLimited { resumes_at: at };
        let value = serde_json::to_value(&limited).expect("encode");
        assert_eq!(value["type"], "ratelimited");
        assert!(value["data"]["resumesAt"].is_string());

        let decoded: StatusEvent = serde_json::from_value(serde_json::to_value(&event).unwrap())
            .expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn persisted_flat_events_decode() {
        let raw = serde_json::json!([
            {"uid": 4, "at": "2024-01-01T00:00:05Z", "type": "idle"},
            {"uid": 3, "at": "2024-01-01T00:00:04Z", "type": "errored",
             "data": {"err": {"message": "boom", "when": "fetching", "chain": []}}},
        ]);

        let events: Vec<StatusEvent> = serde_json::from_value(raw).expect("decode");
        assert_eq!(events[0].status, StatusKind::Idle);
        assert!(matches!(
            &events[1].status,
            StatusKind::Errored { err } if err.message == "boom" && err.when == Some(Phase::Fetching)
        ));
        assert_eq!(StatusLog::restore(events).record(StatusKind::Ready).uid, 5);
    }

    #[test]
    fn error_report_captures_source_chain() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "socket closed");
        #[derive(Debug)]
        struct Outer(std::io::Error);
        impl std::fmt::Display for Outer {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("request failed")
            }
        }
        impl StdError for Outer {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let report = ErrorReport::from_error(&Outer(inner), Some(Phase::Fetching));
        assert_eq!(report.message, "request failed");
        assert_eq!(report.chain, vec!["socket closed".to_string()]);
        assert_eq!(report.when, Some(Phase::Fetching));
    }
}
