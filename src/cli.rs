use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;

use crate::adapters::{HttpDisputeSource, HttpGateway};
use crate::config::Config;
use crate::services::{Engine, Repositories};

#[derive(Parser)]
#[command(name = "payflow-core")]
#[command(about = "Payflow Core - payment mediation engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Run one pass of a scheduled job and print its report
    #[command(subcommand)]
    Jobs(JobCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum JobCommands {
    /// Charge every due subscription
    Billing,
    /// Mirror gateway disputes into local chargebacks
    Disputes,
    /// Attempt every due webhook delivery
    Webhooks,
    /// Delete expired idempotency records
    PurgeIdempotency,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

/// Wires the engine over Postgres and the HTTP gateway bindings.
pub fn build_engine(config: &Config, pool: PgPool) -> Engine {
    let gateway = HttpGateway::new(
        config.gateway_url.clone(),
        config.gateway_api_key.clone(),
        config.gateway_timeout(),
    );
    let disputes = HttpDisputeSource::new(
        config.dispute_source_url.clone(),
        config.gateway_api_key.clone(),
        config.gateway_timeout(),
    );
    tracing::info!(
        gateway_url = %config.gateway_url,
        dispute_source_url = %config.dispute_source_url,
        "Gateway clients initialized"
    );

    Engine::new(
        Repositories::postgres(pool),
        Arc::new(gateway),
        Arc::new(disputes),
        config.engine_settings(),
    )
}

pub async fn handle_job(config: &Config, job: JobCommands) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let engine = build_engine(config, pool);
    let now = Utc::now();

    match job {
        JobCommands::Billing => print_report("Billing", &engine.run_billing(now).await?),
        JobCommands::Disputes => {
            print_report("Dispute sync", &engine.run_dispute_sync(now).await?)
        }
        JobCommands::Webhooks => {
            print_report("Webhook delivery", &engine.deliver_webhooks(now).await?)
        }
        JobCommands::PurgeIdempotency => {
            let purged = engine.purge_idempotency().await?;
            tracing::info!(purged, "Expired idempotency records purged");
            println!("✓ Purged {} expired idempotency records", purged);
            Ok(())
        }
    }
}

fn print_report<T: Serialize>(name: &str, report: &T) -> anyhow::Result<()> {
    println!("✓ {} finished", name);
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;
    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Gateway URL: {}", config.gateway_url);
    println!(
        "  Gateway API Key: {}",
        if config.gateway_api_key.is_some() { "set" } else { "not set" }
    );
    println!("  Dispute Source URL: {}", config.dispute_source_url);
    println!("  Gateway Timeout: {}s", config.gateway_timeout_secs);
    println!("  Idempotency TTL: {}s", config.idempotency_ttl_secs);
    println!("  Billing Max Retries: {}", config.billing_max_retries);
    println!("  Dispute Lookback: {}h", config.dispute_lookback_hours);
    println!(
        "  Webhooks: timeout {}s, concurrency {}",
        config.webhook_timeout_secs, config.webhook_concurrency
    );
    println!("  Job Lock Timeout: {}s", config.job_lock_timeout_secs);

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
