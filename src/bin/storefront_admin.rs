use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use storefront_checkout::{
    config::{self, AppConfig},
    db,
    events::{self, EventSender},
    services::{catalog::DbCatalog, gateways::stripe, orders::OrderService},
};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(
    name = "storefront-admin",
    about = "Operational commands for the storefront checkout service",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Expire unpaid draft and placed orders once
    SweepDrafts {
        /// Override the configured draft order TTL
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Print a Stripe-Signature header for a payload file
    SignWebhook {
        /// File holding the exact request body
        #[arg(long)]
        payload: PathBuf,
        /// Signing secret; defaults to the configured webhook secret
        #[arg(long)]
        secret: Option<String>,
        /// Unix timestamp to sign with; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    match cli.command {
        Commands::Migrate => migrate(&cfg).await?,
        Commands::SweepDrafts { ttl_secs } => sweep_drafts(&cfg, ttl_secs, cli.json).await?,
        Commands::SignWebhook {
            payload,
            secret,
            timestamp,
        } => sign_webhook(&cfg, payload, secret, timestamp, cli.json)?,
    }

    Ok(())
}

async fn migrate(cfg: &AppConfig) -> Result<()> {
    let pool = db::establish_connection_from_app_config(cfg).await?;
    db::run_migrations(&pool).await?;
    println!("Migrations applied");
    Ok(())
}

async fn sweep_drafts(cfg: &AppConfig, ttl_secs: Option<u64>, json: bool) -> Result<()> {
    let pool = Arc::new(db::establish_connection_from_app_config(cfg).await?);
    let (tx, rx) = mpsc::channel(cfg.event_channel_capacity);
    tokio::spawn(events::process_events(rx, None));

    let orders = OrderService::new(
        pool.clone(),
        Arc::new(DbCatalog::new(pool)),
        Arc::new(EventSender::new(tx)),
        cfg.currency.clone(),
    );

    let ttl = match ttl_secs {
        Some(secs) => chrono::Duration::seconds(
            i64::try_from(secs).map_err(|_| anyhow!("ttl {} is out of range", secs))?,
        ),
        None => cfg.draft_order_ttl(),
    };

    let expired = orders.expire_stale_drafts(ttl).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&expired)?);
    } else {
        println!("Expired {} order(s)", expired.len());
        for id in expired {
            println!("  {}", id);
        }
    }
    Ok(())
}

fn sign_webhook(
    cfg: &AppConfig,
    payload: PathBuf,
    secret: Option<String>,
    timestamp: Option<i64>,
    json: bool,
) -> Result<()> {
    let body = fs::read(&payload)
        .with_context(|| format!("failed to read payload {}", payload.display()))?;
    let secret = secret
        .or_else(|| cfg.stripe.webhook_secret.clone())
        .ok_or_else(|| anyhow!("no secret given and APP__STRIPE__WEBHOOK_SECRET is not set"))?;
    let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp());

    let header = stripe::signature_header(&secret, &body, timestamp)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "header": stripe::SIGNATURE_HEADER,
                "value": header,
            }))?
        );
    } else {
        println!("{}: {}", stripe::SIGNATURE_HEADER, header);
    }
    Ok(())
}
