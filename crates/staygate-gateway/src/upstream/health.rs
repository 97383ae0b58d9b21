//! Periodic and on-demand upstream health probing.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Upstream, UpstreamRegistry};
use crate::error::GatewayError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Drives health transitions for every registered upstream.
///
/// The first sweep runs before the ready signal fires, so callers waiting on
/// [`HealthChecker::wait_until_ready`] observe a fully-probed registry.
/// Probes run on a background task with their own timeout; client
/// cancellation never aborts one.
#[derive(Debug)]
pub struct HealthChecker {
    registry: Arc<UpstreamRegistry>,
    client: reqwest::Client,
    interval: Duration,
    ready: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        interval: Duration,
    ) -> Result<Arc<Self>, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Config(format!("health client: {err}")))?;

        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        let (ready, _) = watch::channel(false);

        Ok(Arc::new(Self {
            registry,
            client,
            interval,
            ready,
        }))
    }

    /// Runs the initial sweep, fires the ready signal, then ticks every
    /// `interval` until cancelled. An empty registry is ready immediately
    /// and starts no ticker.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        if self.registry.is_empty() {
            let _ = self.ready.send(true);
            return;
        }

        let checker = self.clone();
        tokio::spawn(async move {
            checker.sweep().await;
            let _ = checker.ready.send(true);

            let mut ticker = tokio::time::interval(checker.interval);
            // Consume the immediate first tick; the initial sweep just ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => checker.sweep().await,
                }
            }
        });
    }

    /// Resolves once the first sweep has completed. Idempotent.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Probes every upstream in turn. A failing probe marks its upstream
    /// and moves on; it never suspends the ticker.
    pub async fn sweep(&self) {
        for upstream in self.registry.all() {
            self.probe(&upstream).await;
        }
    }

    /// One-shot probe against an upstream's health URL.
    pub async fn probe(&self, upstream: &Upstream) {
        match self.client.get(upstream.health_url()).send().await {
            Ok(response) if response.status().as_u16() < 400 => {
                upstream.mark_healthy(Utc::now());
            }
            Ok(response) => {
                let error = format!("health check status {}", response.status().as_u16());
                tracing::debug!(upstream = %upstream.name(), error = %error, "health probe failed");
                upstream.mark_unhealthy(Utc::now(), &error);
            }
            Err(err) => {
                let error = err.to_string();
                tracing::debug!(upstream = %upstream.name(), error = %error, "health probe failed");
                upstream.mark_unhealthy(Utc::now(), &error);
            }
        }
    }

    /// Dispatches an off-cycle probe without blocking the caller, used when
    /// a breaker opens.
    pub fn spawn_probe(self: &Arc<Self>, upstream: Arc<Upstream>) {
        let checker = self.clone();
        tokio::spawn(async move {
            checker.probe(&upstream).await;
        });
    }
}
