use std::error::Error as StdError;

use crate::webhooks::validation::RejectionReason;

/// Common error type for `replicator_core`.
///
/// Store implementations (Postgres, in-memory) should preserve the underlying
/// error chain where possible via `Error::store`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Webhook signature, shared secret or source address check failed.
    #[error("webhook rejected: {0}")]
    ValidationRejected(RejectionReason),

    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("dependency ambiguous: {0}")]
    DependencyAmbiguous(String),

    /// Non-success response (or transport failure/timeout) from a source API.
    #[error("upstream fetch failed (status {status:?}): {message}")]
    UpstreamFetch {
        status: Option<u16>,
        message: String,
    },

    #[error("store error: {context}")]
    Store {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("store error: {0}")]
    StoreMessage(String),

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    #[tracing::instrument(level = "debug", name = "replicator.error.store", skip(source))]
    pub fn store(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            context: context.into(),
            source: Box::new(source),
        }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::UpstreamFetch {
            status,
            message: message.into(),
        }
    }

    /// HTTP status the webhook transport should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidInput(_) => 400,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::ValidationRejected(reason) => reason.http_status(),
            Error::DependencyMissing(_) | Error::DependencyAmbiguous(_) => 412,
            Error::UpstreamFetch { .. } => 502,
            Error::Store { .. } | Error::StoreMessage(_) => 500,
            Error::Cancelled => 503,
        }
    }

    /// Stable machine-readable kind, used in response bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::ValidationRejected(_) => "validation_rejected",
            Error::DependencyMissing(_) => "dependency_missing",
            Error::DependencyAmbiguous(_) => "dependency_ambiguous",
            Error::UpstreamFetch { .. } => "upstream_fetch",
            Error::Store { .. } | Error::StoreMessage(_) => "store",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
