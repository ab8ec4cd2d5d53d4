use clap::{Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "replicator", version, about = "Webhook and backfill replication service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the HTTP server and backfill worker (default if no subcommand given).
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, default_value = "8000")]
        port: u16,

        /// Run against process-local stores instead of Postgres.
        #[arg(long, env = "REPLICATOR_IN_MEMORY")]
        in_memory: bool,

        /// Token required on `/api/v1` admin routes.
        #[arg(long, env = "REPLICATOR_ADMIN_TOKEN", hide_env_values = true)]
        admin_token: Option<String>,
    },

    /// Apply configuration-store migrations.
    Migrate {
        /// Postgres URL override (else REPLICATOR_DATABASE_URL / DATABASE_URL).
        #[arg(long)]
        database_url: Option<String>,
    },

    /// Run one backfill job in the foreground.
    Backfill {
        job_id: Uuid,

        /// Reset a job left running by a crashed process instead of running it.
        #[arg(long)]
        release: bool,
    },

    /// Delete expired rows from one integration's table.
    DeleteStale {
        integration_id: Uuid,

        /// Ignore the age ceiling (first pass on a new deployment).
        #[arg(long)]
        initial: bool,
    },
}
