use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CycleResult, Snapshot};

/// Outcome of folding one cycle into the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleCounts {
    pub total_count: usize,
    pub updated_count: usize,
    pub created_count: usize,
}

impl CycleCounts {
    pub fn new(created_count: usize, updated_count: usize) -> Self {
        Self {
            total_count: created_count + updated_count,
            updated_count,
            created_count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_count == 0
    }
}

/// Folds a cycle's records into the snapshot by record id.
///
/// Known ids are replaced in place and counted as updates; unknown ids are
/// appended and counted as creations. Resources only present in the cycle get
/// an empty sequence first.
pub fn merge_cycle(snapshot: &mut Snapshot, cycle: CycleResult) -> CycleCounts {
    let mut created = 0usize;
    let mut updated = 0usize;

    for (key, records) in cycle {
        let existing = snapshot.entry(key).or_default();
        let mut positions: HashMap<String, usize> = existing
            .iter()
            .enumerate()
            .map(|(i, record)| (record.id.clone(), i))
            .collect();

        for record in records {
            match positions.get(&record.id) {
                Some(&i) => {
                    existing[i] = record;
                    updated += 1;
                }
                None => {
                    positions.insert(record.id.clone(), existing.len());
                    existing.push(record);
                    created += 1;
                }
            }
        }
    }

    CycleCounts::new(created, updated)
}

/// Newest parseable `last_modified` across every record of the cycle.
pub fn newest_modified(cycle: &CycleResult) -> Option<DateTime<Utc>> {
    cycle
        .values()
        .flatten()
        .filter_map(|record| record.last_modified())
        .max()
}

/// Like [`newest_modified`], falling back to the current time.
pub fn newest_modified_date(cycle: &CycleResult) -> DateTime<Utc> {
    newest_modified(cycle).unwrap_or_else(Utc::now)
}
