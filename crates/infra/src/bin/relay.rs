//! Outbox relay: publishes pending accounting records as JSON lines on stdout.
//!
//! Configuration comes from `config/stockledger.toml` and `STOCKLEDGER__*`
//! variables (a `.env` file is honoured). Stops on Ctrl-C.

use std::io::Write;
use std::sync::{Arc, mpsc};

use anyhow::Context;
use tokio::sync::watch;

use stockledger_events::{AccountingMessage, EventBus, Subscription};
use stockledger_infra::{LedgerConfig, OutboxRelay, PgDatabase};

/// Writes every message to stdout; a downstream process does the posting.
#[derive(Debug, Default)]
struct StdoutBus;

impl EventBus<AccountingMessage> for StdoutBus {
    type Error = anyhow::Error;

    fn publish(&self, message: AccountingMessage) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&message)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
        Ok(())
    }

    fn subscribe(&self) -> Subscription<AccountingMessage> {
        let (_tx, rx) = mpsc::channel();
        Subscription::new(rx)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    stockledger_observability::init();

    let config = LedgerConfig::load().context("loading configuration")?;
    let db = PgDatabase::connect(&config.database, config.lock.timeout())
        .await
        .context("connecting to postgres")?;
    db.migrate().await.context("applying schema")?;

    let relay = OutboxRelay::new(Arc::new(db), StdoutBus, &config.outbox);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        let _ = shutdown_tx.send(true);
    });

    relay.run(shutdown_rx).await;
    Ok(())
}
