//! Scripted in-memory transport for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use basesync_core::{Fields, Record};
use basesync_storage::{RecordPage, Transport, TransportError};
use parking_lot::Mutex;

pub fn record(id: &str, fields: serde_json::Value) -> Record {
    let fields: Fields = fields.as_object().cloned().unwrap_or_default();
    Record::new(id, fields)
}

/// Answers each resource from its own queue of canned responses; an empty
/// queue answers with an empty final page.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<HashMap<String, VecDeque<Result<RecordPage, TransportError>>>>,
    latency: Mutex<HashMap<String, Duration>>,
    requests: Mutex<Vec<(String, BTreeMap<String, String>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, resource: &str, response: Result<RecordPage, TransportError>) {
        self.responses
            .lock()
            .entry(resource.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn push_page(&self, resource: &str, records: Vec<Record>, offset: Option<&str>) {
        self.push(
            resource,
            Ok(RecordPage {
                records,
                offset: offset.map(str::to_string),
            }),
        );
    }

    pub fn push_status(&self, resource: &str, status: u16, body: serde_json::Value) {
        self.push(resource, Err(TransportError::Status { status, body }));
    }

    pub fn push_error(&self, resource: &str, err: TransportError) {
        self.push(resource, Err(err));
    }

    /// Delays every response for `resource`.
    pub fn set_latency(&self, resource: &str, latency: Duration) {
        self.latency.lock().insert(resource.to_string(), latency);
    }

    /// Every request issued so far, in order.
    pub fn requests(&self) -> Vec<(String, BTreeMap<String, String>)> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, resource: &str) -> Vec<BTreeMap<String, String>> {
        self.requests
            .lock()
            .iter()
            .filter(|(name, _)| name == resource)
            .map(|(_, query)| query.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn list_records(
        &self,
        resource: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<RecordPage, TransportError> {
        self.requests
            .lock()
            .push((resource.to_string(), query.clone()));
        let latency = self.latency.lock().get(resource).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.responses
            .lock()
            .get_mut(resource)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(RecordPage::default()))
    }
}
