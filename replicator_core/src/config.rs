use crate::{Error, Result};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let url = std::env::var("REPLICATOR_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .map_err(|_| Error::InvalidInput("REPLICATOR_DATABASE_URL is required".to_string()))?;
        let max_connections = env_parse::<u32>("REPLICATOR_DATABASE_MAX_CONNECTIONS").unwrap_or(10);
        let acquire_timeout_ms =
            env_parse::<u64>("REPLICATOR_DATABASE_ACQUIRE_TIMEOUT_MS").unwrap_or(5_000);
        let cfg = Self {
            url,
            max_connections,
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidInput("postgres.url is empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidInput(
                "postgres.max_connections must be > 0".to_string(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "postgres.acquire_timeout must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retention window and statement sizing for the stale row deleter.
///
/// `floor` and `ceiling` are deployment specific and have no defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleRowConfig {
    /// Rows younger than this are never deleted.
    pub floor: Duration,
    /// `run()` leaves rows older than this alone; `run_initial()` ignores it.
    pub ceiling: Duration,
    /// Width of each window increment walked by `run()`.
    pub step: Duration,
    /// Maximum rows removed by a single delete statement.
    pub chunk_size: u32,
}

impl StaleRowConfig {
    pub const DEFAULT_STEP: Duration = Duration::from_secs(4 * 60 * 60);
    pub const DEFAULT_CHUNK_SIZE: u32 = 1_000;

    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            step: Self::DEFAULT_STEP,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Reads `REPLICATOR_STALE_*` variables. Floor and ceiling are required.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let floor = env_parse::<u64>("REPLICATOR_STALE_FLOOR_SECS").ok_or_else(|| {
            Error::InvalidInput("REPLICATOR_STALE_FLOOR_SECS is required".to_string())
        })?;
        let ceiling = env_parse::<u64>("REPLICATOR_STALE_CEILING_SECS").ok_or_else(|| {
            Error::InvalidInput("REPLICATOR_STALE_CEILING_SECS is required".to_string())
        })?;
        let mut cfg = Self::new(Duration::from_secs(floor), Duration::from_secs(ceiling));
        if let Some(step) = env_parse::<u64>("REPLICATOR_STALE_STEP_SECS") {
            cfg.step = Duration::from_secs(step);
        }
        if let Some(chunk) = env_parse::<u32>("REPLICATOR_STALE_CHUNK_SIZE") {
            cfg.chunk_size = chunk;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.floor.is_zero() {
            return Err(Error::InvalidInput("stale.floor must be > 0".to_string()));
        }
        if self.ceiling <= self.floor {
            return Err(Error::InvalidInput(
                "stale.ceiling must be > stale.floor".to_string(),
            ));
        }
        if self.step.is_zero() {
            return Err(Error::InvalidInput("stale.step must be > 0".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(Error::InvalidInput(
                "stale.chunk_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub max_payload_bytes: usize,
    /// Base URL webhook senders reach us on, used in onboarding output text.
    pub public_base_url: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1_000_000,
            public_base_url: "http://localhost:8000".to_string(),
        }
    }
}

impl WebhookConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            max_payload_bytes: env_parse::<usize>("REPLICATOR_WEBHOOK_MAX_PAYLOAD_BYTES")
                .unwrap_or(defaults.max_payload_bytes),
            public_base_url: std::env::var("REPLICATOR_PUBLIC_BASE_URL")
                .unwrap_or(defaults.public_base_url),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_bytes == 0 {
            return Err(Error::InvalidInput(
                "webhook.max_payload_bytes must be > 0".to_string(),
            ));
        }
        if self.public_base_url.trim().is_empty() {
            return Err(Error::InvalidInput(
                "webhook.public_base_url is empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn webhook_url(&self, opaque_id: &str) -> String {
        format!(
            "{}/webhooks/{}",
            self.public_base_url.trim_end_matches('/'),
            opaque_id
        )
    }

    pub fn onboarding_url(&self, opaque_id: &str, step: &str) -> String {
        format!(
            "{}/integrations/{}/onboarding/{}",
            self.public_base_url.trim_end_matches('/'),
            opaque_id,
            step
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackfillConfig {
    /// Upper bound on pages fetched by one run. `None` runs until exhausted.
    pub max_pages: Option<u64>,
}

impl BackfillConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Self {
        Self {
            max_pages: env_parse::<u64>("REPLICATOR_BACKFILL_MAX_PAGES").filter(|n| *n > 0),
        }
    }
}

/// Process-level configuration for the replicator services.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    pub postgres: PostgresConfig,
    pub stale_rows: StaleRowConfig,
    pub webhook: WebhookConfig,
    pub backfill: BackfillConfig,
}

impl ReplicatorConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            postgres: PostgresConfig::from_env()?,
            stale_rows: StaleRowConfig::from_env()?,
            webhook: WebhookConfig::from_env()?,
            backfill: BackfillConfig::from_env(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
