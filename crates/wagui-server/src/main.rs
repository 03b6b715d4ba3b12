use anyhow::Context;
use std::net::SocketAddr;
use tracing::{error, info};
use wagui_server::{
    config::{init_logging, load_config},
    open_store,
    routes::{build_router, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr()))?;
    let store = open_store(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path))?;

    let state = AppState::from_config(store, &config);
    let follower = state.follower.clone();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        event = "server_start",
        addr = %addr,
        db_path = %config.db_path,
        transcript_root = %config.transcript_root.display()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "server_error", error = %err);
    }
    follower.stop();
    info!(event = "server_stop");
    Ok(())
}
