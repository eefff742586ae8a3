use anyhow::Result;
use chrono::{NaiveDate, Utc};
use clap::ArgMatches;
use tracing::info;

use super::provider_client;
use crate::core::Connection;
use crate::provider::{self, DateRange};
use crate::settings::Settings;
use crate::store::SqliteStore;
use crate::sync::{Engine, RefreshWindow, SyncError};

fn parse_date(raw: &str) -> Result<NaiveDate> {
    Ok(NaiveDate::parse_from_str(raw, "%Y-%m-%d")?)
}

fn window_from_args(matches: &ArgMatches) -> Result<RefreshWindow> {
    let begin = matches.value_of("begin").map(parse_date).transpose()?;
    let until = matches.value_of("until").map(parse_date).transpose()?;

    if begin.is_none() && until.is_none() {
        return Ok(if matches.is_present("force") {
            RefreshWindow::Full
        } else {
            RefreshWindow::Incremental
        });
    }

    Ok(RefreshWindow::Range(DateRange {
        from: begin,
        to: until.unwrap_or_else(|| Utc::now().naive_utc().date()),
    }))
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let user = matches
        .value_of("user")
        .unwrap_or(&settings.default_user)
        .to_string();
    let window = window_from_args(matches)?;

    let connections: Vec<Connection> = store
        .connections()
        .list(&user)
        .await?
        .into_iter()
        .filter(Connection::is_active)
        .collect();

    if connections.is_empty() {
        println!("no active bank connections for {user}; run `bursar link` first");
        return Ok(());
    }

    let engine = Engine::new(provider_client(&settings));

    for connection in connections {
        info!(
            connection = %connection.provider_connection_id,
            "pulling accounts and transactions"
        );

        match engine.sync(&mut store, &connection, window).await {
            Ok(report) => {
                println!(
                    "{}: {} accounts ({} new), {} transactions ingested, {} duplicates skipped",
                    connection.provider_connection_id,
                    report.accounts_synced,
                    report.accounts_created,
                    report.transactions_ingested,
                    report.transactions_skipped,
                );
                for error in &report.errors {
                    println!("  warning: {error}");
                }
            }
            Err(SyncError::Provider(provider::Error::TokenInvalid)) => {
                println!(
                    "{}: access revoked, reconnect with `bursar link`",
                    connection.provider_connection_id
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
