use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::{Error, Result};

static IDENT: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{0,62}$"));

static SESSION_VALUE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]{1,64}$"));

fn regex_match(re: &LazyLock<std::result::Result<Regex, regex::Error>>, value: &str) -> Result<bool> {
    match &**re {
        Ok(re) => Ok(re.is_match(value)),
        Err(e) => Err(Error::InvalidInput(format!("validation regex error: {e}"))),
    }
}

/// Column always present: primary key.
pub const ID_COLUMN: &str = "id";
/// Column always present: stable id in the source system (unique).
pub const EXTERNAL_ID_COLUMN: &str = "external_id";
/// Column always present: the normalized source document.
pub const DATA_COLUMN: &str = "data";
/// Column always present: ingestion time.
pub const ROW_CREATED_AT_COLUMN: &str = "row_created_at";

const RESERVED: &[&str] = &[ID_COLUMN, EXTERNAL_ID_COLUMN, DATA_COLUMN, ROW_CREATED_AT_COLUMN];

/// Validates a table/column identifier before it is interpolated into SQL.
pub fn validate_ident(ident: &str) -> Result<()> {
    if regex_match(&IDENT, ident)? {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid identifier '{ident}'")))
    }
}

pub(crate) fn validate_session_value(value: &str) -> Result<()> {
    if regex_match(&SESSION_VALUE, value)? {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "invalid session option value '{value}'"
        )))
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    BigInt,
    Double,
    Boolean,
    Timestamp,
    Json,
}

impl ColumnType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::Json => "JSONB",
        }
    }
}

/// Adapter-defined denormalized/enrichment column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One logical table per integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    /// Recognized last-modified timestamp column (adapter-defined name).
    pub last_modified_column: String,
    pub columns: Vec<ColumnSpec>,
    /// Secondary indexes, each a list of column names.
    pub indexes: Vec<Vec<String>>,
}

impl TableSchema {
    pub fn new(table: impl Into<String>, last_modified_column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            last_modified_column: last_modified_column.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(ColumnSpec::new(name, column_type));
        self
    }

    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        if name == self.last_modified_column || name == ROW_CREATED_AT_COLUMN {
            return Some(ColumnType::Timestamp);
        }
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.column_type)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(table = %self.table))]
    pub fn validate(&self) -> Result<()> {
        validate_ident(&self.table)?;
        validate_ident(&self.last_modified_column)?;
        if RESERVED.contains(&self.last_modified_column.as_str()) {
            return Err(Error::InvalidInput(format!(
                "last_modified_column '{}' collides with a reserved column",
                self.last_modified_column
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for col in &self.columns {
            validate_ident(&col.name)?;
            if RESERVED.contains(&col.name.as_str()) || col.name == self.last_modified_column {
                return Err(Error::InvalidInput(format!(
                    "column '{}' collides with a reserved column",
                    col.name
                )));
            }
            if !seen.insert(col.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate column '{}'",
                    col.name
                )));
            }
        }
        for index in &self.indexes {
            if index.is_empty() {
                return Err(Error::InvalidInput("empty index definition".to_string()));
            }
            for col in index {
                if self.column_type(col).is_none() && col != EXTERNAL_ID_COLUMN {
                    return Err(Error::InvalidInput(format!(
                        "index references unknown column '{col}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks that every value in `columns` names a declared column of a matching type.
    pub fn check_columns(&self, columns: &Columns) -> Result<()> {
        for (name, value) in columns {
            let Some(expected) = self.columns.iter().find(|c| &c.name == name) else {
                return Err(Error::InvalidInput(format!(
                    "column '{name}' is not declared on table '{}'",
                    self.table
                )));
            };
            if !value.fits(expected.column_type) {
                return Err(Error::InvalidInput(format!(
                    "column '{name}' expects {:?}",
                    expected.column_type
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    Null,
    Text(String),
    BigInt(i64),
    Double(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
}

impl ColumnValue {
    pub fn fits(&self, column_type: ColumnType) -> bool {
        matches!(
            (self, column_type),
            (ColumnValue::Null, _)
                | (ColumnValue::Text(_), ColumnType::Text)
                | (ColumnValue::BigInt(_), ColumnType::BigInt)
                | (ColumnValue::Double(_), ColumnType::Double)
                | (ColumnValue::Boolean(_), ColumnType::Boolean)
                | (ColumnValue::Timestamp(_), ColumnType::Timestamp)
                | (ColumnValue::Json(_), ColumnType::Json)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ColumnValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for ColumnValue {
    fn from(value: &str) -> Self {
        ColumnValue::Text(value.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(value: String) -> Self {
        ColumnValue::Text(value)
    }
}

impl From<i64> for ColumnValue {
    fn from(value: i64) -> Self {
        ColumnValue::BigInt(value)
    }
}

impl From<bool> for ColumnValue {
    fn from(value: bool) -> Self {
        ColumnValue::Boolean(value)
    }
}

impl From<DateTime<Utc>> for ColumnValue {
    fn from(value: DateTime<Utc>) -> Self {
        ColumnValue::Timestamp(value)
    }
}

/// Adapter-defined columns keyed by name.
pub type Columns = BTreeMap<String, ColumnValue>;

/// A conditional write: applied only if `last_modified` is newer than the stored row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub external_id: String,
    pub last_modified: DateTime<Utc>,
    pub data: serde_json::Value,
    pub columns: Columns,
}

/// A row at rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub external_id: String,
    pub last_modified: DateTime<Utc>,
    pub data: serde_json::Value,
    pub columns: Columns,
    pub row_created_at: DateTime<Utc>,
}

/// Result of `RowStore::upsert_row`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    Updated { previous: Option<StoredRow> },
    /// The stored row is as new or newer; nothing was written.
    Stale { stored_last_modified: DateTime<Utc> },
}

/// Adapter-defined "expired" rule: `status_column IN expired_values`, aged by `age_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryPredicate {
    pub status_column: String,
    pub expired_values: Vec<String>,
    pub age_column: String,
}

impl ExpiryPredicate {
    pub fn new(
        status_column: impl Into<String>,
        expired_values: &[&str],
        age_column: impl Into<String>,
    ) -> Self {
        Self {
            status_column: status_column.into(),
            expired_values: expired_values.iter().map(|v| v.to_string()).collect(),
            age_column: age_column.into(),
        }
    }

    pub fn validate(&self, schema: &TableSchema) -> Result<()> {
        validate_ident(&self.status_column)?;
        validate_ident(&self.age_column)?;
        if self.expired_values.is_empty() {
            return Err(Error::InvalidInput(
                "expiry predicate has no expired values".to_string(),
            ));
        }
        if schema.column_type(&self.status_column) != Some(ColumnType::Text) {
            return Err(Error::InvalidInput(format!(
                "status column '{}' must be a text column",
                self.status_column
            )));
        }
        if schema.column_type(&self.age_column) != Some(ColumnType::Timestamp) {
            return Err(Error::InvalidInput(format!(
                "age column '{}' must be a timestamp column",
                self.age_column
            )));
        }
        Ok(())
    }

    /// Restricts the predicate to rows whose age timestamp falls in `[not_before, before)`.
    pub fn within(&self, not_before: Option<DateTime<Utc>>, before: DateTime<Utc>) -> DeletePredicate {
        DeletePredicate {
            expiry: self.clone(),
            not_before,
            before,
        }
    }
}

/// A bounded delete: expired rows whose age timestamp is in `[not_before, before)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePredicate {
    pub expiry: ExpiryPredicate,
    pub not_before: Option<DateTime<Utc>>,
    pub before: DateTime<Utc>,
}

impl DeletePredicate {
    pub fn matches(&self, status: Option<&str>, age: Option<DateTime<Utc>>) -> bool {
        let Some(status) = status else {
            return false;
        };
        let Some(age) = age else {
            return false;
        };
        if !self.expiry.expired_values.iter().any(|v| v == status) {
            return false;
        }
        if age >= self.before {
            return false;
        }
        match self.not_before {
            Some(lower) => age >= lower,
            None => true,
        }
    }
}

/// Session options applied for the duration of one statement's transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionScope {
    pub options: Vec<(String, String)>,
}

impl SessionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// Forces index-driven plans (`enable_seqscan = off`).
    pub fn without_seqscan() -> Self {
        Self::new().with("enable_seqscan", "off")
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in &self.options {
            validate_ident(name)?;
            validate_session_value(value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn schema() -> TableSchema {
        TableSchema::new("calls_abc", "updated_at")
            .column("status", ColumnType::Text)
            .column("amount", ColumnType::BigInt)
            .index(&["status", "updated_at"])
    }

    #[test]
    fn schema_validation_rejects_reserved_and_unsafe_names() {
        assert!(schema().validate().is_ok());
        assert!(
            TableSchema::new("t", "updated_at")
                .column("data", ColumnType::Json)
                .validate()
                .is_err()
        );
        assert!(TableSchema::new("t; drop", "updated_at").validate().is_err());
        assert!(TableSchema::new("t", "id").validate().is_err());
        assert!(
            TableSchema::new("t", "updated_at")
                .index(&["missing"])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn column_check_enforces_declared_types() {
        let mut cols = Columns::new();
        cols.insert("status".into(), "done".into());
        assert!(schema().check_columns(&cols).is_ok());
        cols.insert("amount".into(), "ten".into());
        assert!(schema().check_columns(&cols).is_err());
        let mut unknown = Columns::new();
        unknown.insert("nope".into(), ColumnValue::Null);
        assert!(schema().check_columns(&unknown).is_err());
    }

    #[test]
    fn delete_predicate_window_is_half_open() {
        let now = Utc::now();
        let expiry = ExpiryPredicate::new("status", &["completed"], "updated_at");
        let pred = expiry.within(Some(now - Duration::days(2)), now - Duration::days(1));

        assert!(pred.matches(Some("completed"), Some(now - Duration::days(2))));
        assert!(pred.matches(Some("completed"), Some(now - Duration::hours(30))));
        assert!(!pred.matches(Some("completed"), Some(now - Duration::days(1))));
        assert!(!pred.matches(Some("completed"), Some(now - Duration::days(3))));
        assert!(!pred.matches(Some("active"), Some(now - Duration::hours(30))));
        assert!(!pred.matches(None, Some(now - Duration::hours(30))));
    }

    #[test]
    fn session_scope_rejects_injection() {
        assert!(SessionScope::without_seqscan().validate().is_ok());
        assert!(
            SessionScope::new()
                .with("enable_seqscan", "off; drop table x")
                .validate()
                .is_err()
        );
    }
}
