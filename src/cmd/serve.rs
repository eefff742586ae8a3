use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::ArgMatches;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::info;

use super::provider_client;
use crate::server::{self, Context};
use crate::settings::Settings;
use crate::store::SqliteStore;
use crate::sync::Engine;

async fn shutdown_signal() {
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

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    println!("signal received, starting graceful shutdown");
}

pub async fn run(matches: &ArgMatches, settings: Settings) -> Result<()> {
    let store = SqliteStore::new(&settings.db_url()).await?;
    let engine = Engine::new(provider_client(&settings));

    let ctx = Arc::new(Context {
        store: Mutex::new(store),
        engine,
    });

    let addr: SocketAddr = matches
        .value_of("listen")
        .unwrap_or(&settings.listen)
        .parse()?;
    info!(%addr, "listening");

    axum::Server::bind(&addr)
        .serve(server::router(ctx).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
