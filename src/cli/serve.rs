//! HTTP API server command.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

use vboxctl::api::state::ApiState;
use vboxctl::api::ticker::Ticker;
use vboxctl::{Error, Result};
use vboxctl_sim::{Platform, SimConfig};

use super::GlobalOpts;

/// Serve a simulated platform over HTTP.
#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Listen address.
    #[arg(short, long, default_value = "127.0.0.1:18083")]
    listen: String,
}

impl ServeCmd {
    /// Run the serve command.
    ///
    /// `--user`/`--passwd`, when given, become the credentials the platform
    /// accepts.
    pub fn run(self, opts: &GlobalOpts) -> Result<()> {
        let addr: SocketAddr = self.listen.parse().map_err(|e| {
            Error::Config(format!("invalid listen address '{}': {}", self.listen, e))
        })?;

        let mut config = SimConfig::demo();
        if let Some(user) = &opts.user {
            config = config.with_credentials(user.clone(), opts.passwd.clone().unwrap_or_default());
        }

        let runtime = tokio::runtime::Runtime::new().map_err(Error::Io)?;
        runtime.block_on(async move { run_server(addr, Platform::new(config)).await })
    }
}

async fn run_server(addr: SocketAddr, platform: Platform) -> Result<()> {
    let state = Arc::new(ApiState::new(Arc::new(platform)));
    let app = vboxctl::api::create_router(state.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ticker = tokio::spawn(Ticker::new(state, shutdown_rx).run());

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::Io)?;

    tracing::info!(address = %addr, "starting HTTP API server");
    println!("vboxctl API server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
        .map_err(Error::Io);

    let _ = shutdown_tx.send(true);
    if let Err(e) = ticker.await {
        tracing::warn!(error = %e, "ticker task failed");
    }
    served
}
