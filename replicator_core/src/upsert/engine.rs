use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::OrgId;
use crate::replicator::traits::{NormalizedRow, Replicator};
use crate::store::schema::{RowWrite, StoredRow, TableSchema, UpsertOutcome};
use crate::store::traits::{RowStore, RowStoreResolver};
use crate::upsert::diff::{EnrichmentStatus, UpsertDiff, UpsertSummary, changed_fields};
use crate::Result;

/// Applies normalized source documents to an integration's table under the
/// ordering invariant: a stored row is only ever replaced by a strictly newer one.
///
/// The compare-and-write itself is delegated to `RowStore::upsert_row`, which
/// must be indivisible per external id. The read that precedes it only decides
/// whether enrichment is worth fetching.
pub struct UpsertEngine {
    rows: Arc<dyn RowStoreResolver>,
    ensured: RwLock<HashSet<(OrgId, String)>>,
}

impl UpsertEngine {
    pub fn new(rows: Arc<dyn RowStoreResolver>) -> Self {
        Self {
            rows,
            ensured: RwLock::new(HashSet::new()),
        }
    }

    pub async fn row_store(&self, org_id: OrgId) -> Result<Arc<dyn RowStore>> {
        self.rows.row_store(org_id).await
    }

    /// Create (or extend) the replicator's table. Idempotent; the DDL is issued
    /// once per table per engine.
    #[tracing::instrument(level = "debug", skip_all, fields(integration = %replicator.integration().id))]
    pub async fn ensure_table(&self, replicator: &dyn Replicator) -> Result<TableSchema> {
        let schema = replicator.table_schema();
        schema.validate()?;
        let key = (replicator.integration().org_id, schema.table.clone());
        if self.ensured.read().await.contains(&key) {
            return Ok(schema);
        }

        let store = self.rows.row_store(key.0).await?;
        store.create_table(&schema).await?;
        self.ensured.write().await.insert(key);
        Ok(schema)
    }

    /// Forget which tables were created for `org_id` (after they were dropped).
    pub async fn forget_org(&self, org_id: OrgId) {
        self.ensured.write().await.retain(|(org, _)| *org != org_id);
    }

    /// Normalize `raw` through the replicator and apply it.
    pub async fn upsert(
        &self,
        replicator: &dyn Replicator,
        raw: &serde_json::Value,
    ) -> Result<UpsertDiff> {
        let row = replicator.normalize(raw)?;
        self.upsert_normalized(replicator, row).await
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(integration = %replicator.integration().id, external_id = %row.external_id)
    )]
    pub async fn upsert_normalized(
        &self,
        replicator: &dyn Replicator,
        mut row: NormalizedRow,
    ) -> Result<UpsertDiff> {
        let schema = self.ensure_table(replicator).await?;
        schema.check_columns(&row.columns)?;
        let store = self.rows.row_store(replicator.integration().org_id).await?;

        let existing = store.get_row(&schema.table, &row.external_id).await?;
        if let Some(stored) = existing.as_ref().filter(|s| row.last_modified <= s.last_modified) {
            return Ok(rejected(&row, stored.last_modified));
        }

        let enrichment = match replicator.enricher() {
            None => EnrichmentStatus::NotApplicable,
            Some(enricher) => match enricher.fetch_enrichment(&row).await {
                Ok(Some(extra)) => {
                    schema.check_columns(&extra)?;
                    row.columns.extend(extra);
                    EnrichmentStatus::Applied
                }
                Ok(None) => EnrichmentStatus::NotApplicable,
                Err(err) if enricher.required() => return Err(err),
                Err(err) => {
                    tracing::warn!(error = %err, external_id = %row.external_id, "enrichment failed; writing base row");
                    EnrichmentStatus::Failed(err.to_string())
                }
            },
        };

        let write = RowWrite {
            external_id: row.external_id.clone(),
            last_modified: row.last_modified,
            data: row.data,
            columns: row.columns,
        };
        let outcome = store.upsert_row(&schema.table, &write).await?;
        Ok(match outcome {
            UpsertOutcome::Inserted => UpsertDiff::Inserted {
                external_id: write.external_id,
                enrichment,
            },
            UpsertOutcome::Updated { previous } => {
                let changed = previous
                    .as_ref()
                    .or(existing.as_ref())
                    .map(|prev| changed_fields(prev, &write.data, &write.columns))
                    .unwrap_or_else(|| all_fields(&write));
                UpsertDiff::Updated {
                    external_id: write.external_id,
                    changed_fields: changed,
                    enrichment,
                }
            }
            UpsertOutcome::Stale {
                stored_last_modified,
            } => {
                tracing::warn!(
                    external_id = %write.external_id,
                    stored = %stored_last_modified,
                    attempted = %write.last_modified,
                    "stale write rejected by store"
                );
                UpsertDiff::Rejected {
                    external_id: write.external_id,
                    stored_last_modified,
                    attempted_last_modified: write.last_modified,
                }
            }
        })
    }

    /// Apply a batch in order. Stops at the first error.
    #[tracing::instrument(level = "debug", skip_all, fields(integration = %replicator.integration().id, items = raws.len()))]
    pub async fn upsert_many(
        &self,
        replicator: &dyn Replicator,
        raws: &[serde_json::Value],
    ) -> Result<UpsertSummary> {
        let mut summary = UpsertSummary::default();
        for raw in raws {
            summary.push(self.upsert(replicator, raw).await?);
        }
        Ok(summary)
    }

    /// Drop the replicator's table and forget it.
    pub async fn drop_table(&self, replicator: &dyn Replicator) -> Result<()> {
        let table = replicator.integration().table_name();
        let org_id = replicator.integration().org_id;
        self.rows.row_store(org_id).await?.drop_table(&table).await?;
        self.ensured.write().await.remove(&(org_id, table));
        Ok(())
    }
}

fn rejected(row: &NormalizedRow, stored: chrono::DateTime<chrono::Utc>) -> UpsertDiff {
    tracing::warn!(
        external_id = %row.external_id,
        stored = %stored,
        attempted = %row.last_modified,
        "stale write rejected"
    );
    UpsertDiff::Rejected {
        external_id: row.external_id.clone(),
        stored_last_modified: stored,
        attempted_last_modified: row.last_modified,
    }
}

fn all_fields(write: &RowWrite) -> Vec<String> {
    let empty = StoredRow {
        external_id: write.external_id.clone(),
        last_modified: write.last_modified,
        data: serde_json::Value::Object(Default::default()),
        columns: Default::default(),
        row_created_at: write.last_modified,
    };
    changed_fields(&empty, &write.data, &write.columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServiceIntegration;
    use crate::replicator::traits::Enricher;
    use crate::store::memory::MemoryRowStore;
    use crate::store::schema::{ColumnType, ColumnValue, Columns};
    use crate::store::traits::SharedRowStore;
    use crate::webhooks::validation::WebhookValidation;
    use crate::Error;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Orders {
        integration: ServiceIntegration,
        enrich: Option<(bool, bool)>,
        enrich_calls: AtomicUsize,
    }

    impl Orders {
        fn new(enrich: Option<(bool, bool)>) -> Self {
            Self {
                integration: ServiceIntegration::new(OrgId::new(), "orders", None).unwrap(),
                enrich,
                enrich_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Enricher for Orders {
        async fn fetch_enrichment(&self, _row: &NormalizedRow) -> Result<Option<Columns>> {
            self.enrich_calls.fetch_add(1, Ordering::SeqCst);
            let (ok, _) = self.enrich.unwrap_or((true, false));
            if !ok {
                return Err(Error::upstream(Some(500), "enrichment down"));
            }
            let mut cols = Columns::new();
            cols.insert("customer_name".into(), ColumnValue::Text("Ada".into()));
            Ok(Some(cols))
        }

        fn required(&self) -> bool {
            self.enrich.map(|(_, required)| required).unwrap_or(false)
        }
    }

    impl Replicator for Orders {
        fn service_name(&self) -> &str {
            "orders"
        }

        fn integration(&self) -> &ServiceIntegration {
            &self.integration
        }

        fn table_schema(&self) -> TableSchema {
            TableSchema::new(self.integration.table_name(), "updated_at")
                .column("status", ColumnType::Text)
                .column("customer_name", ColumnType::Text)
        }

        fn webhook_validation(&self) -> WebhookValidation {
            WebhookValidation::None
        }

        fn normalize(&self, raw: &serde_json::Value) -> Result<NormalizedRow> {
            let id = raw["id"].as_str().unwrap_or_default();
            let ts = raw["updated_at"].as_i64().unwrap_or_default();
            let status = raw["status"].as_str().unwrap_or("open");
            Ok(NormalizedRow::new(id, at(ts), raw.clone())?.with_column("status", status))
        }

        fn enricher(&self) -> Option<&dyn Enricher> {
            self.enrich.map(|_| self as &dyn Enricher)
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn engine() -> (UpsertEngine, MemoryRowStore) {
        let store = MemoryRowStore::new();
        let engine = UpsertEngine::new(Arc::new(SharedRowStore(Arc::new(store.clone()))));
        (engine, store)
    }

    #[tokio::test]
    async fn insert_update_then_reject_older() {
        let (engine, store) = engine();
        let r = Orders::new(None);

        let diff = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 10, "status": "open"}))
            .await
            .unwrap();
        assert!(matches!(diff, UpsertDiff::Inserted { .. }));

        let diff = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 20, "status": "paid"}))
            .await
            .unwrap();
        match diff {
            UpsertDiff::Updated { changed_fields, .. } => {
                assert!(changed_fields.contains(&"status".to_string()));
                assert!(changed_fields.contains(&"updated_at".to_string()));
            }
            other => panic!("expected update, got {other:?}"),
        }

        let diff = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 15, "status": "open"}))
            .await
            .unwrap();
        assert!(matches!(diff, UpsertDiff::Rejected { .. }));

        let rows = store.rows(&r.integration.table_name()).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].last_modified, at(20));
        assert_eq!(rows[0].data["status"], "paid");
    }

    #[tokio::test]
    async fn equal_timestamp_is_rejected() {
        let (engine, _store) = engine();
        let r = Orders::new(None);
        let doc = json!({"id": "o1", "updated_at": 10});
        engine.upsert(&r, &doc).await.unwrap();
        assert!(!engine.upsert(&r, &doc).await.unwrap().is_applied());
    }

    #[tokio::test]
    async fn enrichment_merges_into_write_and_skips_stale() {
        let (engine, store) = engine();
        let r = Orders::new(Some((true, false)));

        let diff = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 10}))
            .await
            .unwrap();
        assert_eq!(diff.enrichment(), Some(&EnrichmentStatus::Applied));
        let rows = store.rows(&r.integration.table_name()).await;
        assert_eq!(
            rows[0].columns.get("customer_name"),
            Some(&ColumnValue::Text("Ada".into()))
        );

        engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 5}))
            .await
            .unwrap();
        assert_eq!(r.enrich_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn optional_enrichment_failure_still_writes() {
        let (engine, store) = engine();
        let r = Orders::new(Some((false, false)));
        let diff = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 10}))
            .await
            .unwrap();
        assert!(matches!(
            diff.enrichment(),
            Some(EnrichmentStatus::Failed(_))
        ));
        assert_eq!(store.rows(&r.integration.table_name()).await.len(), 1);
    }

    #[tokio::test]
    async fn required_enrichment_failure_aborts_write() {
        let (engine, store) = engine();
        let r = Orders::new(Some((false, true)));
        let err = engine
            .upsert(&r, &json!({"id": "o1", "updated_at": 10}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamFetch { .. }));
        assert!(store.rows(&r.integration.table_name()).await.is_empty());
    }

    #[tokio::test]
    async fn stored_row_tracks_maximum_timestamp_for_any_order() {
        let orders: [[i64; 4]; 3] = [[1, 2, 3, 4], [4, 3, 2, 1], [2, 4, 1, 3]];
        for order in orders {
            let (engine, store) = engine();
            let r = Orders::new(None);
            for ts in order {
                engine
                    .upsert(&r, &json!({"id": "o1", "updated_at": ts, "v": ts}))
                    .await
                    .unwrap();
            }
            let rows = store.rows(&r.integration.table_name()).await;
            assert_eq!(rows[0].last_modified, at(4));
            assert_eq!(rows[0].data["v"], 4);
        }
    }

    #[tokio::test]
    async fn upsert_many_summarises_batch() {
        let (engine, _store) = engine();
        let r = Orders::new(None);
        let page = vec![
            json!({"id": "a", "updated_at": 1}),
            json!({"id": "b", "updated_at": 1}),
            json!({"id": "a", "updated_at": 2}),
            json!({"id": "b", "updated_at": 1}),
        ];
        let summary = engine.upsert_many(&r, &page).await.unwrap();
        assert_eq!(
            (summary.inserted, summary.updated, summary.stale),
            (2, 1, 1)
        );
    }
}
