use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};

use crate::config::PostgresConfig;
use crate::store::schema::{
    ColumnType, ColumnValue, Columns, DATA_COLUMN, DeletePredicate, EXTERNAL_ID_COLUMN,
    ROW_CREATED_AT_COLUMN, RowWrite, SessionScope, StoredRow, TableSchema, UpsertOutcome,
    validate_ident,
};
use crate::store::traits::RowStore;
use crate::{Error, Result};
use std::sync::Arc;

/// Postgres-backed RowStore (one pool per organization database).
///
/// Table schemas are read from the catalog once and cached until this store
/// creates or drops the table.
#[derive(Clone)]
pub struct PostgresRowStore {
    pool: PgPool,
    schemas: Arc<DashMap<String, TableSchema>>,
}

fn quote(ident: &str) -> Result<String> {
    validate_ident(ident)?;
    Ok(format!("\"{ident}\""))
}

fn bind_value<'q>(
    q: Query<'q, Postgres, PgArguments>,
    column_type: ColumnType,
    value: &ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match (value, column_type) {
        (ColumnValue::Null, ColumnType::Text) => q.bind(Option::<String>::None),
        (ColumnValue::Null, ColumnType::BigInt) => q.bind(Option::<i64>::None),
        (ColumnValue::Null, ColumnType::Double) => q.bind(Option::<f64>::None),
        (ColumnValue::Null, ColumnType::Boolean) => q.bind(Option::<bool>::None),
        (ColumnValue::Null, ColumnType::Timestamp) => q.bind(Option::<DateTime<Utc>>::None),
        (ColumnValue::Null, ColumnType::Json) => {
            q.bind(Option::<sqlx::types::Json<serde_json::Value>>::None)
        }
        (ColumnValue::Text(v), _) => q.bind(v.clone()),
        (ColumnValue::BigInt(v), _) => q.bind(*v),
        (ColumnValue::Double(v), _) => q.bind(*v),
        (ColumnValue::Boolean(v), _) => q.bind(*v),
        (ColumnValue::Timestamp(v), _) => q.bind(*v),
        (ColumnValue::Json(v), _) => q.bind(sqlx::types::Json(v.clone())),
    }
}

fn decode_value(row: &PgRow, name: &str, column_type: ColumnType) -> Result<ColumnValue> {
    let err = |e| Error::store(format!("decode column {name}"), e);
    let value = match column_type {
        ColumnType::Text => row
            .try_get::<Option<String>, _>(name)
            .map_err(err)?
            .map(ColumnValue::Text),
        ColumnType::BigInt => row
            .try_get::<Option<i64>, _>(name)
            .map_err(err)?
            .map(ColumnValue::BigInt),
        ColumnType::Double => row
            .try_get::<Option<f64>, _>(name)
            .map_err(err)?
            .map(ColumnValue::Double),
        ColumnType::Boolean => row
            .try_get::<Option<bool>, _>(name)
            .map_err(err)?
            .map(ColumnValue::Boolean),
        ColumnType::Timestamp => row
            .try_get::<Option<DateTime<Utc>>, _>(name)
            .map_err(err)?
            .map(ColumnValue::Timestamp),
        ColumnType::Json => row
            .try_get::<Option<serde_json::Value>, _>(name)
            .map_err(err)?
            .map(ColumnValue::Json),
    };
    Ok(value.unwrap_or(ColumnValue::Null))
}

impl PostgresRowStore {
    #[tracing::instrument(level = "debug", skip(cfg))]
    pub async fn connect(cfg: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(cfg.acquire_timeout)
            .connect(&cfg.url)
            .await
            .map_err(|e| Error::store("connect row store", e))?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schemas: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn schema(&self, table: &str) -> Result<TableSchema> {
        if let Some(cached) = self.schemas.get(table) {
            return Ok(cached.clone());
        }
        let schema = self.load_schema(table).await?;
        self.schemas.insert(table.to_string(), schema.clone());
        Ok(schema)
    }

    /// Columns are read back from the catalog so rows decode against the live table.
    async fn load_schema(&self, table: &str) -> Result<TableSchema> {
        validate_ident(table)?;
        let rows = sqlx::query(
            r#"
SELECT a.attname AS name, format_type(a.atttypid, a.atttypmod) AS type,
       COALESCE(obj_description(c.oid, 'pg_class'), '') AS comment
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE c.relname = $1 AND n.nspname = current_schema()
  AND c.relkind = 'r' AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attnum
"#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::store("load table schema", e))?;

        if rows.is_empty() {
            return Err(Error::NotFound(format!("table '{table}' not found")));
        }

        // The table comment records which column carries last-modified.
        let comment: String = rows[0]
            .try_get("comment")
            .map_err(|e| Error::store("table comment", e))?;
        let last_modified = comment
            .strip_prefix("last_modified=")
            .ok_or_else(|| {
                Error::StoreMessage(format!("table '{table}' is missing its last_modified marker"))
            })?
            .to_string();

        let mut schema = TableSchema::new(table, last_modified.clone());
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| Error::store("attname", e))?;
            let ty: String = row.try_get("type").map_err(|e| Error::store("atttype", e))?;
            if ["id", EXTERNAL_ID_COLUMN, DATA_COLUMN, ROW_CREATED_AT_COLUMN].contains(&name.as_str())
                || name == last_modified
            {
                continue;
            }
            let column_type = match ty.as_str() {
                "text" => ColumnType::Text,
                "bigint" => ColumnType::BigInt,
                "double precision" => ColumnType::Double,
                "boolean" => ColumnType::Boolean,
                "timestamp with time zone" => ColumnType::Timestamp,
                "jsonb" => ColumnType::Json,
                other => {
                    return Err(Error::StoreMessage(format!(
                        "unsupported column type '{other}' on {table}.{name}"
                    )));
                }
            };
            schema = schema.column(name, column_type);
        }
        Ok(schema)
    }

    fn row_from_pg(schema: &TableSchema, row: &PgRow) -> Result<StoredRow> {
        let mut columns = Columns::new();
        for col in &schema.columns {
            columns.insert(col.name.clone(), decode_value(row, &col.name, col.column_type)?);
        }
        Ok(StoredRow {
            external_id: row
                .try_get(EXTERNAL_ID_COLUMN)
                .map_err(|e| Error::store("external_id", e))?,
            last_modified: row
                .try_get(schema.last_modified_column.as_str())
                .map_err(|e| Error::store("last_modified", e))?,
            data: row
                .try_get(DATA_COLUMN)
                .map_err(|e| Error::store("data", e))?,
            columns,
            row_created_at: row
                .try_get(ROW_CREATED_AT_COLUMN)
                .map_err(|e| Error::store("row_created_at", e))?,
        })
    }

    fn predicate_sql(predicate: &DeletePredicate) -> Result<String> {
        let status = quote(&predicate.expiry.status_column)?;
        let age = quote(&predicate.expiry.age_column)?;
        let mut sql = format!("{status} = ANY($1) AND {age} < $2");
        if predicate.not_before.is_some() {
            sql.push_str(&format!(" AND {age} >= $3"));
        }
        Ok(sql)
    }
}

#[async_trait]
impl RowStore for PostgresRowStore {
    #[tracing::instrument(level = "info", skip(self, schema), fields(table = %schema.table))]
    async fn create_table(&self, schema: &TableSchema) -> Result<()> {
        schema.validate()?;
        let table = quote(&schema.table)?;
        let lm = quote(&schema.last_modified_column)?;

        let mut statements = vec![
            format!(
                r#"CREATE TABLE IF NOT EXISTS {table} (
  "id" BIGSERIAL PRIMARY KEY,
  "external_id" TEXT NOT NULL UNIQUE,
  "data" JSONB NOT NULL,
  {lm} TIMESTAMPTZ NOT NULL,
  "row_created_at" TIMESTAMPTZ NOT NULL DEFAULT now()
)"#
            ),
            format!(
                "COMMENT ON TABLE {table} IS 'last_modified={}'",
                schema.last_modified_column
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} ({lm})",
                quote(&index_name(&schema.table, &[schema.last_modified_column.as_str()]))?
            ),
        ];
        for col in &schema.columns {
            statements.push(format!(
                "ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} {}",
                quote(&col.name)?,
                col.column_type.sql_type()
            ));
        }
        for index in &schema.indexes {
            let cols: Vec<&str> = index.iter().map(String::as_str).collect();
            let quoted = cols
                .iter()
                .map(|c| quote(c))
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {table} ({quoted})",
                quote(&index_name(&schema.table, &cols))?
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store("begin create table", e))?;
        for stmt in statements {
            sqlx::query(&stmt)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store(format!("create table {}", schema.table), e))?;
        }
        tx.commit()
            .await
            .map_err(|e| Error::store("commit create table", e))?;
        self.schemas.remove(&schema.table);
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn drop_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote(table)?))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::store("drop table", e))?;
        self.schemas.remove(table);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_row(&self, table: &str, external_id: &str) -> Result<Option<StoredRow>> {
        let schema = self.schema(table).await?;
        let sql = format!(
            "SELECT * FROM {} WHERE \"external_id\" = $1",
            quote(table)?
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::store("get row", e))?;
        row.map(|r| Self::row_from_pg(&schema, &r)).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, write), fields(external_id = %write.external_id))]
    async fn upsert_row(&self, table: &str, write: &RowWrite) -> Result<UpsertOutcome> {
        let schema = self.schema(table).await?;
        schema.check_columns(&write.columns)?;
        let qt = quote(table)?;
        let lm = quote(&schema.last_modified_column)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store("begin upsert", e))?;

        // Row lock serializes concurrent writers for this external id.
        let previous = sqlx::query(&format!(
            "SELECT * FROM {qt} WHERE \"external_id\" = $1 FOR UPDATE"
        ))
        .bind(&write.external_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::store("lock row", e))?
        .map(|r| Self::row_from_pg(&schema, &r))
        .transpose()?;

        let mut names = vec![
            "\"external_id\"".to_string(),
            "\"data\"".to_string(),
            lm.clone(),
        ];
        let mut updates = vec![
            "\"data\" = EXCLUDED.\"data\"".to_string(),
            format!("{lm} = EXCLUDED.{lm}"),
        ];
        for name in write.columns.keys() {
            let q = quote(name)?;
            updates.push(format!("{q} = EXCLUDED.{q}"));
            names.push(q);
        }
        let placeholders = (1..=names.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {qt} ({}) VALUES ({placeholders}) \
             ON CONFLICT (\"external_id\") DO UPDATE SET {} \
             WHERE {qt}.{lm} < EXCLUDED.{lm} \
             RETURNING (xmax = 0) AS inserted",
            names.join(", "),
            updates.join(", ")
        );

        let mut q = sqlx::query(&sql)
            .bind(&write.external_id)
            .bind(sqlx::types::Json(&write.data))
            .bind(write.last_modified);
        for (name, value) in &write.columns {
            let column_type = schema
                .column_type(name)
                .ok_or_else(|| Error::InvalidInput(format!("unknown column '{name}'")))?;
            q = bind_value(q, column_type, value);
        }

        let returned = q
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| Error::store("conditional upsert", e))?;

        let outcome = match returned {
            Some(row) => {
                let inserted: bool = row
                    .try_get("inserted")
                    .map_err(|e| Error::store("inserted flag", e))?;
                if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated { previous }
                }
            }
            None => {
                let stored_last_modified = match &previous {
                    Some(p) => p.last_modified,
                    None => sqlx::query_scalar::<_, DateTime<Utc>>(&format!(
                        "SELECT {lm} FROM {qt} WHERE \"external_id\" = $1"
                    ))
                    .bind(&write.external_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| Error::store("read stored last_modified", e))?,
                };
                UpsertOutcome::Stale {
                    stored_last_modified,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| Error::store("commit upsert", e))?;
        Ok(outcome)
    }

    #[tracing::instrument(level = "debug", skip(self, predicate, session))]
    async fn delete_where(
        &self,
        table: &str,
        predicate: &DeletePredicate,
        limit: u32,
        session: &SessionScope,
    ) -> Result<u64> {
        session.validate()?;
        let qt = quote(table)?;
        let filter = Self::predicate_sql(predicate)?;
        let limit_param = if predicate.not_before.is_some() { 4 } else { 3 };
        let sql = format!(
            "DELETE FROM {qt} WHERE \"id\" IN \
             (SELECT \"id\" FROM {qt} WHERE {filter} LIMIT ${limit_param})"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::store("begin delete", e))?;
        for (name, value) in &session.options {
            // SET does not take bind parameters; both parts were validated above.
            sqlx::query(&format!("SET LOCAL {name} = '{value}'"))
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::store(format!("set local {name}"), e))?;
        }

        let mut q = sqlx::query(&sql)
            .bind(&predicate.expiry.expired_values)
            .bind(predicate.before);
        if let Some(lower) = predicate.not_before {
            q = q.bind(lower);
        }
        let result = q
            .bind(i64::from(limit))
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::store(format!("delete stale rows from {table}"), e))?;

        tx.commit()
            .await
            .map_err(|e| Error::store("commit delete", e))?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip(self, predicate))]
    async fn count_where(&self, table: &str, predicate: &DeletePredicate) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote(table)?,
            Self::predicate_sql(predicate)?
        );
        let mut q = sqlx::query_scalar::<_, i64>(&sql)
            .bind(&predicate.expiry.expired_values)
            .bind(predicate.before);
        if let Some(lower) = predicate.not_before {
            q = q.bind(lower);
        }
        let n = q
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::store("count rows", e))?;
        Ok(n.max(0) as u64)
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn set_autovacuum(&self, table: &str, enabled: bool) -> Result<()> {
        let flag = if enabled { "on" } else { "off" };
        sqlx::query(&format!(
            "ALTER TABLE {} SET (autovacuum_enabled = {flag})",
            quote(table)?
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| Error::store("alter autovacuum", e))?;
        Ok(())
    }
}

fn index_name(table: &str, columns: &[&str]) -> String {
    let mut name = format!("{table}_{}_idx", columns.join("_"));
    name.truncate(63);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ExpiryPredicate;

    #[test]
    fn predicate_sql_binds_lower_bound_only_when_present() {
        let expiry = ExpiryPredicate::new("status", &["done"], "updated_at");
        let open = expiry.within(None, Utc::now());
        assert_eq!(
            PostgresRowStore::predicate_sql(&open).unwrap(),
            "\"status\" = ANY($1) AND \"updated_at\" < $2"
        );
        let bounded = expiry.within(Some(Utc::now()), Utc::now());
        assert!(
            PostgresRowStore::predicate_sql(&bounded)
                .unwrap()
                .ends_with("AND \"updated_at\" >= $3")
        );
    }

    #[test]
    fn index_names_fit_postgres_limit() {
        let long = "t".repeat(60);
        assert!(index_name(&long, &["a", "b"]).len() <= 63);
    }
}
