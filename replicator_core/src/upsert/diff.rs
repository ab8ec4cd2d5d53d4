use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::store::schema::{Columns, StoredRow};

/// Outcome of the enrichment hook for one applied write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum EnrichmentStatus {
    NotApplicable,
    Applied,
    /// Optional enrichment failed; the base row was still written.
    Failed(String),
}

/// Row-level result of one upsert, returned to the webhook handler / backfill runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpsertDiff {
    Inserted {
        external_id: String,
        enrichment: EnrichmentStatus,
    },
    Updated {
        external_id: String,
        /// Top-level `data` keys and denormalized columns whose value changed.
        changed_fields: Vec<String>,
        enrichment: EnrichmentStatus,
    },
    /// Ordering check failed: the stored row is as new or newer. Nothing written.
    Rejected {
        external_id: String,
        stored_last_modified: DateTime<Utc>,
        attempted_last_modified: DateTime<Utc>,
    },
}

impl UpsertDiff {
    pub fn external_id(&self) -> &str {
        match self {
            UpsertDiff::Inserted { external_id, .. }
            | UpsertDiff::Updated { external_id, .. }
            | UpsertDiff::Rejected { external_id, .. } => external_id,
        }
    }

    /// True when the write reached the store.
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpsertDiff::Rejected { .. })
    }

    pub fn enrichment(&self) -> Option<&EnrichmentStatus> {
        match self {
            UpsertDiff::Inserted { enrichment, .. } | UpsertDiff::Updated { enrichment, .. } => {
                Some(enrichment)
            }
            UpsertDiff::Rejected { .. } => None,
        }
    }
}

/// Fields that differ between the row at rest and the incoming write.
pub fn changed_fields(
    previous: &StoredRow,
    data: &serde_json::Value,
    columns: &Columns,
) -> Vec<String> {
    let mut changed = BTreeSet::new();

    match (previous.data.as_object(), data.as_object()) {
        (Some(old), Some(new)) => {
            for (key, value) in new {
                if old.get(key) != Some(value) {
                    changed.insert(key.clone());
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    changed.insert(key.clone());
                }
            }
        }
        _ => {
            if previous.data != *data {
                changed.insert(crate::store::schema::DATA_COLUMN.to_string());
            }
        }
    }

    for (name, value) in columns {
        if previous.columns.get(name) != Some(value) {
            changed.insert(name.clone());
        }
    }

    changed.into_iter().collect()
}

/// Counters over a batch of upserts, plus the per-row diffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
    pub stale: u64,
    pub enrichment_failures: u64,
    pub diffs: Vec<UpsertDiff>,
}

impl UpsertSummary {
    pub fn push(&mut self, diff: UpsertDiff) {
        match &diff {
            UpsertDiff::Inserted { .. } => self.inserted += 1,
            UpsertDiff::Updated { .. } => self.updated += 1,
            UpsertDiff::Rejected { .. } => self.stale += 1,
        }
        if matches!(diff.enrichment(), Some(EnrichmentStatus::Failed(_))) {
            self.enrichment_failures += 1;
        }
        self.diffs.push(diff);
    }

    /// Rows written (inserted or updated).
    pub fn applied(&self) -> u64 {
        self.inserted + self.updated
    }
}
