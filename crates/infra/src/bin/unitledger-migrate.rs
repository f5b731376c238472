//! Applies the unit ledger schema to the database named by `DATABASE_URL`.

use anyhow::Context;
use tracing::info;

use unitledger_infra::StoreConfig;
use unitledger_infra::unit_store::PostgresUnitStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    unitledger_observability::init();

    let config = StoreConfig::from_env().context("reading store configuration")?;
    let store = PostgresUnitStore::connect(&config)
        .await
        .context("connecting to postgres")?;
    store.migrate().await.context("applying schema")?;

    info!("schema is up to date");
    Ok(())
}
