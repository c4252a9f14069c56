#![allow(clippy::print_stdout)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use invoice_bridge::notify::{LedgerRecorder, LoggingMailSender, OrderConfirmationNotifier};
use invoice_bridge::settlement::InMemoryLedger;
use invoice_bridge::{Config, InvoiceService, connector_from_config};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "invoice-bridge", about = "Lightning node invoice bridge")]
struct Args {
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Stream invoice settlements until interrupted (default).
    Run,
    /// Print node info as JSON.
    Info,
    /// Print active public channels as JSON.
    Channels,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = Config::from_env().context("load invoice bridge config")?;
    let ledger = Arc::new(InMemoryLedger::new());
    let service = InvoiceService::new(
        config.clone(),
        connector_from_config(&config),
        ledger.clone(),
    );

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&service, ledger).await?,
        Command::Info => {
            let info = service.queries().get_info().await.context("get node info")?;
            print_json(&info)?;
        }
        Command::Channels => {
            let channels = service
                .queries()
                .list_channels()
                .await
                .context("list channels")?;
            print_json(&channels)?;
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn run(service: &InvoiceService, ledger: Arc<InMemoryLedger>) -> Result<()> {
    service
        .register_handler(Arc::new(LedgerRecorder::new(ledger)))
        .await;
    service
        .register_handler(Arc::new(OrderConfirmationNotifier::new(
            Arc::new(LoggingMailSender),
            service.config().mail_enabled,
        )))
        .await;

    let handle = service.start(CancellationToken::new());
    tokio::signal::ctrl_c()
        .await
        .context("wait for ctrl-c")?;
    info!("shutting down invoice bridge");
    handle.stop().await.context("join subscription supervisor")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("render json")?;
    println!("{rendered}");
    Ok(())
}
