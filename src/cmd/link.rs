use std::io::Write;
use std::net::SocketAddr;

use anyhow::Result;
use axum::async_trait;
use bank_link::{Grant, LinkConfig, LinkServer, State, Token, TokenExchanger};
use chrono::Utc;
use clap::ArgMatches;
use crossbeam_channel::{bounded, Receiver};
use tokio::signal;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::info;
use url::Url;

use super::provider_client;
use crate::core::ConnectionStatus;
use crate::provider::{truelayer, TokenGrant, TokenSource};
use crate::settings::Settings;
use crate::store::SqliteStore;
use crate::sync::{Engine, RefreshWindow};

const LINK_SCOPE: &str = "accounts balance transactions offline_access";

#[async_trait]
impl TokenExchanger for truelayer::Client {
    async fn exchange(&self, code: &str) -> anyhow::Result<Grant> {
        let grant = TokenSource::exchange_code(self, code).await?;

        Ok(Grant {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_in: grant.expires_at.map(|at| (at - Utc::now()).num_seconds()),
            connection_id: grant.connection_id,
        })
    }
}

async fn shutdown_signal(rx: Receiver<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    let link_complete = async {
        tokio::task::spawn_blocking(move || rx.recv().expect("failed to read from channel"))
            .await
            .unwrap();
    };

    let timeout = async {
        sleep_until(Instant::now() + Duration::from_secs(300)).await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = link_complete => {},
        _ = timeout => {},
    }
}

async fn status(settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let connections = store.connections().list(&settings.default_user).await?;

    let mut tw = tabwriter::TabWriter::new(std::io::stdout());
    writeln!(tw, "Connection ID\tStatus\tToken Expires")?;
    for connection in &connections {
        writeln!(
            tw,
            "{}\t{}\t{}",
            connection.provider_connection_id,
            match &connection.status {
                ConnectionStatus::Active => "active".to_string(),
                ConnectionStatus::Degraded(reason) => format!("degraded ({reason})"),
                ConnectionStatus::Disconnected => "disconnected".to_string(),
            },
            connection
                .expires_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        )?;
    }
    tw.flush()?;

    Ok(())
}

async fn delete(settings: Settings, provider_connection_id: &str) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;

    let connection = store
        .connections()
        .by_provider_id(&settings.default_user, provider_connection_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no connection {provider_connection_id}"))?;

    store.connections().disconnect(&connection.id).await?;
    println!("disconnected {provider_connection_id}; its accounts and transactions are kept");

    Ok(())
}

async fn link_flow(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let mut store = SqliteStore::new(&settings.db_url()).await?;
    let client = provider_client(&settings);

    let link = LinkServer::new(
        client.clone(),
        LinkConfig {
            authorize_url: Url::parse(&settings.provider.authorize_url)?,
            client_id: settings.provider.client_id.clone(),
            redirect_uri: settings.provider.redirect_uri.clone(),
            scope: LINK_SCOPE.to_string(),
        },
    );
    let mut on_exchange = link.on_exchange();

    let port = matches
        .value_of("port")
        .map(str::parse)
        .transpose()?
        .unwrap_or(4545u16);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let (tx, rx) = bounded(1);
    let server = axum::Server::bind(&addr)
        .serve(link.start().into_make_service())
        .with_graceful_shutdown(shutdown_signal(rx));

    let state = State {
        user_id: settings.default_user.clone(),
        context: None,
    };
    println!(
        "Visit http://{}/link?state={} to connect a bank.",
        addr,
        state.to_opaque()?
    );

    let default_user = settings.default_user.clone();
    let engine = Engine::new(client);
    let linker = tokio::spawn(async move {
        let token = match on_exchange.recv().await {
            Ok(token) => token,
            // Server shut down before any exchange completed.
            Err(_) => return Ok::<_, anyhow::Error>(()),
        };

        let user_id = if token.state.user_id.is_empty() {
            default_user
        } else {
            token.state.user_id.clone()
        };

        let connection = engine
            .persist_grant(&mut store, &user_id, to_token_grant(&token))
            .await?;
        info!(
            connection = %connection.provider_connection_id,
            user = %user_id,
            "bank connection linked"
        );

        // An explicit user connect walks the full history; background
        // refreshes stay incremental.
        let report = engine
            .sync(&mut store, &connection, RefreshWindow::Full)
            .await?;
        println!(
            "synced {} accounts, ingested {} transactions ({} duplicates skipped)",
            report.accounts_synced, report.transactions_ingested, report.transactions_skipped
        );
        for error in &report.errors {
            println!("warning: {error}");
        }

        tx.send(()).ok();

        Ok(())
    });

    server.await?;
    linker.await??;

    Ok(())
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    match matches.subcommand() {
        Some(("status", _status_matches)) => status(settings).await,
        Some(("delete", delete_matches)) => {
            // SAFETY: the argument is positional and required, clap rejects
            // the command without it.
            let connection_id = delete_matches.value_of("connection_id").unwrap();
            delete(settings, connection_id).await
        }
        _ => link_flow(matches, settings).await,
    }
}

fn to_token_grant(token: &Token) -> TokenGrant {
    TokenGrant {
        access_token: token.access_token.clone(),
        refresh_token: token.refresh_token.clone(),
        expires_at: token
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        connection_id: token.connection_id.clone(),
    }
}
