//! Staygate gateway binary.
//!
//! HTTP ingress gateway that routes requests to the platform's backend
//! services.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use staygate_gateway::{run, GatewayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "staygate_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load()?;

    info!(
        address = %config.listen_addr(),
        mode = ?config.gateway_mode,
        routes_file = %config.gateway_routes_file.display(),
        "staygate gateway starting"
    );

    let cancel = CancellationToken::new();

    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, initiating graceful shutdown");
        cancel_on_signal.cancel();
    });

    if let Err(e) = run(config, cancel).await {
        error!(error = %e, "gateway error");
        return Err(e.into());
    }

    info!("gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C");
        }
        () = terminate => {
            info!("received SIGTERM");
        }
    }
}
