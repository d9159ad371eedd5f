use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tracing_subscriber::EnvFilter;

use huddle_room::api::{self, MemberStore, RoomSlot};
use huddle_room::config::Config;
use huddle_room::directory::DirectoryClient;
use huddle_room::room::{RoomHandle, RoomSession};
use huddle_room::session::loopback::LoopbackHub;
use huddle_room::{Result, RoomError};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "Room exited with error");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    let (slot, slot_tx) = RoomSlot::new();
    let routes = api::routes(slot, MemberStore::new(), config.serve_directory);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (addr, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(config.bind_address(), async {
            let _ = shutdown_rx.await;
        })
        .map_err(|e| RoomError::internal(format!("Failed to bind server: {}", e)))?;
    let server = tokio::spawn(server);

    tracing::info!(
        %addr,
        serve_directory = config.serve_directory,
        directory_url = %config.directory.base_url,
        "Room server listening"
    );

    let result = join_and_wait(&config, slot_tx).await;

    let _ = shutdown_tx.send(());
    if let Err(e) = server.await {
        tracing::warn!(error = %e, "Server task ended abnormally");
    }
    result
}

async fn join_and_wait(config: &Config, slot_tx: watch::Sender<Option<RoomHandle>>) -> Result<()> {
    let directory = Arc::new(DirectoryClient::new(config.directory.clone())?);
    let hub = LoopbackHub::new();

    let room = match RoomSession::join(
        config.session.join_request(),
        Arc::new(hub.client()),
        directory,
        config.room.clone(),
    )
    .await
    {
        Ok(room) => room,
        Err(e) => {
            tracing::error!(
                error = %e,
                channel = %config.session.channel,
                location = %config.room.lobby_path,
                "Join failed, returning to lobby"
            );
            return Err(e);
        }
    };

    let _ = slot_tx.send(Some(room.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested, unloading room");
            match room.unload().await {
                Ok(report) => tracing::info!(?report, "Room unloaded"),
                Err(e) => tracing::warn!(error = %e, "Room already closed"),
            }
        }
        _ = room.closed() => {
            tracing::info!(location = %config.room.lobby_path, "Room left");
        }
    }

    Ok(())
}
