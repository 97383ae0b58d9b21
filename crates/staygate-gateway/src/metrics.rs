//! In-memory request counters and latency accumulators.
//!
//! All counters live behind a single mutex and reset at process start.
//! Rendering follows the Prometheus text exposition format: request lines
//! sorted by route then numeric status, latency lines sorted by route.

use axum::http::StatusCode;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Default, Clone, Copy)]
struct LatencyStat {
    total: Duration,
    count: u64,
}

#[derive(Debug, Default)]
struct Inner {
    requests: BTreeMap<(String, u16), u64>,
    latencies: BTreeMap<String, LatencyStat>,
}

/// Gateway-wide request metrics.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    inner: Mutex<Inner>,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation. Gated requests observe with zero latency
    /// and still increment the latency count.
    pub fn observe(&self, route: &str, status: StatusCode, latency: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        *inner
            .requests
            .entry((route.to_owned(), status.as_u16()))
            .or_insert(0) += 1;

        let stat = inner.latencies.entry(route.to_owned()).or_default();
        stat.total += latency;
        stat.count += 1;
    }

    /// Renders the exposition body.
    pub fn render(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();

        for ((route, status), count) in &inner.requests {
            let _ = writeln!(
                out,
                "gateway_requests_total{{route=\"{route}\",status=\"{status}\"}} {count}"
            );
        }

        for (route, stat) in &inner.latencies {
            let _ = writeln!(
                out,
                "gateway_request_latency_ms_sum{{route=\"{route}\"}} {:.0}",
                stat.total.as_secs_f64() * 1000.0
            );
            let _ = writeln!(
                out,
                "gateway_request_latency_ms_count{{route=\"{route}\"}} {}",
                stat.count
            );
        }

        out
    }
}
