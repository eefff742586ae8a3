use anyhow::Result;
use clap::ArgMatches;

use crate::display;
use crate::settings::Settings;
use crate::store::SqliteStore;

async fn list(settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let accounts = store.accounts().list(&settings.default_user).await?;

    display::print_accounts(std::io::stdout(), &accounts)?;

    Ok(())
}

async fn balances(settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let accounts = store.accounts().list(&settings.default_user).await?;

    let mut rows = Vec::with_capacity(accounts.len());
    for account in accounts {
        let balance = store.accounts().latest_balance(&account.id).await?;
        rows.push((account, balance));
    }

    display::print_balances(std::io::stdout(), &rows)?;

    Ok(())
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("balance", _)) => balances(settings).await,
        _ => list(settings).await,
    }
}
