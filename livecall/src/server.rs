use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use livecall_core::service::{RoomLogic, StatCollector};
use livecall_core::{Config, RedisCache};
use livecall_sfu::{RtcService, WebRtcTransport};

/// Long-lived services owned by the server
pub struct Services {
    pub logic: Arc<RoomLogic>,
    pub rtc: Arc<RtcService<WebRtcTransport>>,
    pub stats: StatCollector,
    /// Present in cluster mode
    pub redis: Option<Arc<RedisCache>>,
}

/// Main server that runs the HTTP surface until a shutdown signal
pub struct LiveCallServer {
    config: Config,
    services: Services,
}

impl LiveCallServer {
    #[must_use]
    pub const fn new(config: Config, services: Services) -> Self {
        Self { config, services }
    }

    /// Serve until Ctrl+C or SIGTERM, then stop every session and flush stats.
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = crate::http::create_router(self.services.logic.clone(), self.services.rtc.clone());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let graceful = async move {
            let _ = shutdown_rx.changed().await;
        };
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(graceful).await {
                error!("HTTP server error: {}", e);
            }
            info!("HTTP server shut down gracefully");
        });

        shutdown_signal().await;
        info!("Shutting down...");
        let _ = shutdown_tx.send(true);

        let timeout = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        if tokio::time::timeout(timeout, handle).await.is_err() {
            warn!("HTTP server did not stop within {:?}", timeout);
        }

        self.services.rtc.shutdown().await;
        if let Some(redis) = &self.services.redis {
            redis.shutdown();
        }
        self.services.stats.shutdown().await;

        info!("LiveCall server stopped");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
