use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
                Ok(Self(id))
            }
        }
    };
}

uuid_id!(
    /// Tenant identifier. One organization owns one row-store connection pool.
    OrgId
);
uuid_id!(
    /// Service integration identifier.
    IntegrationId
);
uuid_id!(
    /// Backfill job identifier.
    BackfillJobId
);

/// Tenant record. Removing an organization removes every integration table it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub org_id: OrgId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>, now: Option<DateTime<Utc>>) -> Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("organization name is empty".to_string()));
        }
        Ok(Self {
            org_id: OrgId::new(),
            name,
            created_at: now.unwrap_or_else(Utc::now),
        })
    }
}

/// Configured binding between an organization and one external data source.
///
/// Onboarding steps mutate the credential/url fields; the dependency graph
/// manager creates dependents with `depends_on` pointing at their parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceIntegration {
    pub id: IntegrationId,
    pub org_id: OrgId,
    /// Selects the replicator implementation in the registry.
    pub service_name: String,
    /// Stable external reference (used in webhook URLs).
    pub opaque_id: String,
    pub api_url: Option<String>,
    pub backfill_key: Option<String>,
    pub backfill_secret: Option<String>,
    pub webhook_secret: Option<String>,
    pub depends_on: Option<IntegrationId>,
    /// Adapter-specific configuration (allow-listed CIDR blocks, header names, ...).
    #[serde(default)]
    pub settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceIntegration {
    #[tracing::instrument(level = "debug")]
    pub fn new(
        org_id: OrgId,
        service_name: impl Into<String> + std::fmt::Debug,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let service_name = service_name.into();
        if service_name.trim().is_empty() {
            return Err(Error::InvalidInput("service_name is empty".to_string()));
        }
        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            id: IntegrationId::new(),
            org_id,
            service_name,
            opaque_id: Uuid::new_v4().simple().to_string(),
            api_url: None,
            backfill_key: None,
            backfill_secret: None,
            webhook_secret: None,
            depends_on: None,
            settings: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_depends_on(mut self, parent: IntegrationId) -> Self {
        self.depends_on = Some(parent);
        self
    }

    /// Name of the integration's replicated table: `{service}_{opaque_id}`,
    /// lowercased with every non-alphanumeric character folded to `_`.
    pub fn table_name(&self) -> String {
        let raw = format!("{}_{}", self.service_name, self.opaque_id);
        let mut out: String = raw
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        if out.starts_with(|c: char| c.is_ascii_digit()) {
            out.insert(0, '_');
        }
        out.truncate(63);
        out
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

/// Opaque resumable position in a paginated fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub value: serde_json::Value,
}

impl Cursor {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Null and empty-string cursors mean "no further pages".
    pub fn is_exhausted(&self) -> bool {
        match &self.value {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.is_empty(),
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackfillStatus::Pending => "pending",
            BackfillStatus::Running => "running",
            BackfillStatus::Completed => "completed",
            BackfillStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable backfill progress for one integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: BackfillJobId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    /// `None` when never started or when the source has been exhausted.
    pub cursor: Option<Cursor>,
    /// Only rows not yet seen, rather than the full history.
    pub incremental: bool,
    pub status: BackfillStatus,
    pub pages_fetched: u64,
    pub items_upserted: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackfillJob {
    pub fn new(integration: &ServiceIntegration, incremental: bool, now: Option<DateTime<Utc>>) -> Self {
        let now = now.unwrap_or_else(Utc::now);
        Self {
            id: BackfillJobId::new(),
            org_id: integration.org_id,
            integration_id: integration.id,
            cursor: None,
            incremental,
            status: BackfillStatus::Pending,
            pages_fetched: 0,
            items_upserted: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, BackfillStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_a_safe_identifier() {
        let mut integration = ServiceIntegration::new(OrgId::new(), "Stripe-Events", None).unwrap();
        integration.opaque_id = "AB12".to_string();
        assert_eq!(integration.table_name(), "stripe_events_ab12");

        integration.service_name = "3cx".to_string();
        assert_eq!(integration.table_name(), "_3cx_ab12");
    }

    #[test]
    fn empty_cursor_is_exhausted() {
        assert!(Cursor::new(serde_json::Value::Null).is_exhausted());
        assert!(Cursor::new(serde_json::json!("")).is_exhausted());
        assert!(!Cursor::new(serde_json::json!("abc")).is_exhausted());
        assert!(!Cursor::new(serde_json::json!(42)).is_exhausted());
    }

    #[test]
    fn rejects_empty_service_name() {
        let err = ServiceIntegration::new(OrgId::new(), "  ", None).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
