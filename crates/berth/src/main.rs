// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Berth - Container Lifecycle Orchestration Daemon
//!
//! Runs event ingestion, the finalizing stage and orphan recovery against a
//! Docker engine or Swarm cluster. Launches are submitted by an embedding
//! platform that supplies a descriptor resolver.

use std::sync::Arc;
use tracing::{info, warn};

use berth::backend::ExecutionBackend;
use berth::backend::docker::DockerBackend;
use berth::config::Config;
use berth::runtime::BerthRuntime;
use berth::server::ServerSettings;
use berth::store::PostgresStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        server = config.server.as_ref().map(|s| s.host.as_str()).unwrap_or("-"),
        primary_node = config.primary_node,
        poll_secs = config.event_poll_interval.as_secs(),
        "Starting berth"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    berth::migrations::run(&pool).await?;

    info!("Database schema verified");

    let backend = Arc::new(DockerBackend::new(ServerSettings::new(config.server.clone())));
    info!(backend = backend.backend_type(), "Backend initialized");

    let mut builder = BerthRuntime::builder()
        .store(Arc::new(PostgresStore::new(pool)))
        .backend(backend)
        .event_poll_interval(config.event_poll_interval)
        .staging_concurrency(config.staging_concurrency)
        .finalizing_concurrency(config.finalizing_concurrency)
        .primary_node(config.primary_node);
    if let Some(log_dir) = &config.log_dir {
        builder = builder.log_dir(log_dir);
    }

    let runtime = builder.build()?.start().await?;

    info!("Berth ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Berth shut down");

    Ok(())
}
