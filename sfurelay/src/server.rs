//! Server lifecycle management
//!
//! Serves the HTTP router (plain or HTTPS), runs the stats task and tears
//! every session down on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use axum_server::tls_rustls::RustlsConfig;
use sfurelay_api::{create_router, AppState};
use sfurelay_core::Config;
use sfurelay_sfu::SfuManager;

/// Time in-flight requests get to finish once shutdown starts
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// sfurelay server: HTTP listener plus background tasks
pub struct RelayServer {
    config: Config,
    manager: Arc<SfuManager>,
    state: AppState,
}

impl RelayServer {
    pub const fn new(config: Config, manager: Arc<SfuManager>, state: AppState) -> Self {
        Self {
            config,
            manager,
            state,
        }
    }

    /// Start serving and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();

        let stats_handle = self
            .manager
            .spawn_stats_task(self.config.gateway.stats_interval(), shutdown.child_token());

        let http_handle = self.start_http_server(shutdown.clone()).await?;
        info!("Server started successfully");

        tokio::select! {
            result = http_handle => {
                if let Err(e) = result {
                    error!("HTTP server task failed: {}", e);
                }
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        shutdown.cancel();
        let _ = stats_handle.await;

        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&self) {
        info!(
            sessions = self.manager.session_count(),
            consumers = self.manager.consumer_count(),
            "Closing all sessions..."
        );
        self.manager.shutdown().await;
        info!("sfurelay shut down complete");
    }

    /// Bind the listener and serve in a background task
    ///
    /// Binding happens before returning so address errors fail startup.
    async fn start_http_server(&self, shutdown: CancellationToken) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let router = create_router(self.state.clone(), &self.config);

        if self.config.tls.enabled {
            let tls = RustlsConfig::from_pem_file(&self.config.tls.cert_file, &self.config.tls.key_file)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to load TLS certificate/key: {e}"))?;

            let handle = axum_server::Handle::new();
            let graceful = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                graceful.graceful_shutdown(Some(GRACEFUL_SHUTDOWN_TIMEOUT));
            });

            info!("HTTPS server listening on {}", addr);
            return Ok(tokio::spawn(async move {
                if let Err(e) = axum_server::bind_rustls(addr, tls)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                {
                    error!("HTTPS server error: {}", e);
                }
                info!("HTTPS server shut down gracefully");
            }));
        }

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {addr}: {e}"))?;
        info!("HTTP server listening on {}", addr);

        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
            {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        }))
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
