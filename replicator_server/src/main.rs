use clap::Parser;
use replicator_core::config::{BackfillConfig, PostgresConfig, StaleRowConfig, WebhookConfig};
use replicator_core::models::{BackfillJobId, IntegrationId};
use replicator_core::store::postgres_integrations::PostgresIntegrationStore;
use replicator_core::{ReplicatorRegistry, StaleRowDeleter};
use replicator_server::backends::Backends;
use replicator_server::cli::{Cli, Commands};
use replicator_server::jobs::{ChannelJobScheduler, spawn_backfill_worker};
use replicator_server::server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn registry() -> anyhow::Result<ReplicatorRegistry> {
    let mut registry = ReplicatorRegistry::new();
    replicator_integrations::register_all(&mut registry)?;
    Ok(registry)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    replicator_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();

    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        in_memory: false,
        admin_token: None,
    });

    match cmd {
        Commands::Serve {
            host,
            port,
            in_memory,
            admin_token,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let backends = if in_memory {
                Backends::in_memory()
            } else {
                Backends::postgres(&PostgresConfig::from_env()?).await?
            };

            let shutdown = CancellationToken::new();
            cancel_on_ctrl_c(shutdown.clone());
            let (scheduler, rx) = ChannelJobScheduler::new();
            let state = AppState::new(
                backends.integrations,
                backends.rows,
                Arc::new(scheduler),
                registry()?,
                WebhookConfig::from_env()?,
                BackfillConfig::from_env(),
                shutdown.clone(),
            )
            .with_admin_token(admin_token);

            let worker = spawn_backfill_worker(state.runner.clone(), rx, shutdown.clone());
            replicator_server::server::serve(addr, state, shutdown.clone()).await?;
            shutdown.cancel();
            worker.await?;
        }
        Commands::Migrate { database_url } => {
            let cfg = match database_url {
                Some(url) => PostgresConfig {
                    url,
                    max_connections: 2,
                    acquire_timeout: Duration::from_secs(10),
                },
                None => PostgresConfig::from_env()?,
            };
            cfg.validate()?;
            PostgresIntegrationStore::connect(&cfg).await?.migrate().await?;
            tracing::info!("configuration store migrations applied");
        }
        Commands::Backfill { job_id, release } => {
            let backends = Backends::postgres(&PostgresConfig::from_env()?).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let (scheduler, _rx) = ChannelJobScheduler::new();
            let state = AppState::new(
                backends.integrations,
                backends.rows,
                Arc::new(scheduler),
                registry()?,
                WebhookConfig::from_env()?,
                BackfillConfig::from_env(),
                cancel,
            );

            let job_id = BackfillJobId::from(job_id);
            if release {
                let job = state.runner.release(job_id).await?;
                println!("{}", serde_json::to_string_pretty(&job)?);
                return Ok(());
            }

            let job = state.runner.run(job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::DeleteStale {
            integration_id,
            initial,
        } => {
            let backends = Backends::postgres(&PostgresConfig::from_env()?).await?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());
            let (scheduler, _rx) = ChannelJobScheduler::new();
            let state = AppState::new(
                backends.integrations,
                backends.rows,
                Arc::new(scheduler),
                registry()?,
                WebhookConfig::default(),
                BackfillConfig::default(),
                cancel.clone(),
            );
            let deleter = StaleRowDeleter::new(
                state.integrations.clone(),
                state.registry.clone(),
                state.engine.clone(),
                StaleRowConfig::from_env()?,
            )?
            .with_cancellation(cancel);

            let integration_id = IntegrationId::from(integration_id);
            let report = if initial {
                deleter.run_initial(integration_id).await?
            } else {
                deleter.run(integration_id).await?
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
