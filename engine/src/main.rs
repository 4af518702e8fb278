use std::{net::SocketAddr, sync::Arc};

// RadioControl engine
//
// Keeps one internet radio stream playing on this box:
//   - Supervise the media player process (start / stop / status / volume)
//   - Auto-start the stream on boot, retrying on failure
//   - Serve a small JSON API and the dashboard, behind Basic auth

mod api;
mod auth;
mod config;
mod launcher;
mod probe;
mod process;
mod supervisor;
mod volume;

use tracing::{info, warn};

use crate::{
    auth::Credentials,
    config::Config,
    process::{SysinfoProcessTable, TokioCommandRunner},
    supervisor::{AutoStartPolicy, StreamSupervisor},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::load()?;

    let supervisor = Arc::new(StreamSupervisor::new(
        Arc::new(SysinfoProcessTable::new()),
        Arc::new(TokioCommandRunner),
        &cfg,
    ));

    // Boot-time auto-start runs on its own task; the API is served meanwhile.
    supervisor.spawn_auto_start(AutoStartPolicy::from_config(&cfg));

    let creds = Credentials::new(
        cfg.dashboard_settings.username.clone(),
        cfg.dashboard_settings.password.clone(),
    );
    let app = api::build_router(supervisor, creds, &cfg.dashboard_settings.public_dir);

    let addr: SocketAddr = cfg.bind_addr()?;

    info!("RadioControl dashboard starting on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutting down gracefully...");
}
