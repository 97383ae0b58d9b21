//! Upstream registry and per-upstream health/circuit state.
//!
//! One [`Upstream`] exists per distinct target URL; every route bound to
//! that URL shares the same status through the registry. The URL, health
//! path, and name are immutable after construction; only [`UpstreamStatus`]
//! mutates, behind a read/write lock.

mod health;

pub use health::HealthChecker;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use url::Url;

use crate::error::GatewayError;

const DEFAULT_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_THRESHOLD: f64 = 0.5;

/// Rolling-window circuit breaker parameters.
///
/// A non-positive window or threshold is replaced with its default at
/// record time, so configuring `0` re-enables the default rather than
/// disabling the breaker.
#[derive(Debug, Clone, Copy)]
pub struct CircuitPolicy {
    pub window: Duration,
    pub threshold: f64,
    pub cooldown: Duration,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            threshold: DEFAULT_THRESHOLD,
            cooldown: Duration::from_secs(15),
        }
    }
}

/// Mutable health and circuit bookkeeping for one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub requests_in_window: u32,
    pub failures_in_window: u32,
    pub window_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl UpstreamStatus {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            healthy: true,
            last_checked: None,
            last_error: String::new(),
            circuit_open_until: None,
            requests_in_window: 0,
            failures_in_window: 0,
            window_started_at: now,
            unhealthy_since: None,
            consecutive_errors: 0,
        }
    }
}

/// One backend service instance addressable by a single base URL.
#[derive(Debug)]
pub struct Upstream {
    name: String,
    url: Url,
    health_path: String,
    status: RwLock<UpstreamStatus>,
}

impl Upstream {
    fn new(url: Url, health_path: &str) -> Self {
        let name = authority(&url);
        Self {
            name,
            url,
            health_path: health_path.to_owned(),
            status: RwLock::new(UpstreamStatus::new(Utc::now())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Probe target: `{scheme}://{host}{health_path}`, path coerced to a
    /// leading slash.
    pub fn health_url(&self) -> String {
        let path = if self.health_path.starts_with('/') {
            self.health_path.clone()
        } else {
            format!("/{}", self.health_path)
        };
        format!("{}://{}{}", self.url.scheme(), self.name, path)
    }

    /// Returns the rejection reason when the upstream must not receive
    /// traffic: `circuit_open` while the breaker cooldown is running,
    /// otherwise the last recorded error while unhealthy.
    pub fn unavailable_reason(&self, now: DateTime<Utc>) -> Option<String> {
        let status = self.read_status();
        if let Some(until) = status.circuit_open_until {
            if now < until {
                return Some("circuit_open".to_owned());
            }
        }
        if !status.healthy {
            return Some(status.last_error.clone());
        }
        None
    }

    /// Records a proxied-request outcome in the rolling window and reports
    /// whether this observation opened the breaker (the caller schedules an
    /// off-cycle probe when it did).
    pub fn record_result(&self, success: bool, now: DateTime<Utc>, policy: &CircuitPolicy) -> bool {
        let window = if policy.window.is_zero() {
            DEFAULT_WINDOW
        } else {
            policy.window
        };
        let threshold = if policy.threshold <= 0.0 {
            DEFAULT_THRESHOLD
        } else {
            policy.threshold
        };

        let mut status = self.write_status();

        if now - status.window_started_at > to_chrono(window) {
            status.window_started_at = now;
            status.requests_in_window = 0;
            status.failures_in_window = 0;
        }

        status.requests_in_window += 1;
        if success {
            status.consecutive_errors = 0;
        } else {
            status.failures_in_window += 1;
            status.consecutive_errors += 1;
        }

        if !success && status.requests_in_window >= 3 {
            let ratio = f64::from(status.failures_in_window) / f64::from(status.requests_in_window);
            if ratio >= threshold {
                status.circuit_open_until = Some(now + to_chrono(policy.cooldown));
                status.last_error = "circuit opened due to error ratio".to_owned();
                return true;
            }
        }
        false
    }

    /// Marks a successful probe. An expired breaker cooldown is cleared
    /// here, never from the request path.
    pub fn mark_healthy(&self, now: DateTime<Utc>) {
        let mut status = self.write_status();
        status.healthy = true;
        status.last_checked = Some(now);
        status.last_error.clear();
        status.unhealthy_since = None;
        status.consecutive_errors = 0;
        if status.circuit_open_until.is_some_and(|until| now > until) {
            status.circuit_open_until = None;
        }
    }

    pub fn mark_unhealthy(&self, now: DateTime<Utc>, error: &str) {
        let mut status = self.write_status();
        status.healthy = false;
        status.last_checked = Some(now);
        status.last_error = error.to_owned();
        if status.unhealthy_since.is_none() {
            status.unhealthy_since = Some(now);
        }
        status.consecutive_errors += 1;
    }

    pub fn snapshot(&self) -> UpstreamStatus {
        self.read_status().clone()
    }

    fn read_status(&self) -> std::sync::RwLockReadGuard<'_, UpstreamStatus> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_status(&self) -> std::sync::RwLockWriteGuard<'_, UpstreamStatus> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Arena of upstreams keyed by the string form of the parsed target URL.
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    upstreams: HashMap<String, Arc<Upstream>>,
}

impl UpstreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared upstream for `raw_url`, creating it on first
    /// sight. The health path of the first definition wins; an empty one
    /// defaults to `/healthz`.
    pub fn intern(&mut self, raw_url: &str, health_path: &str) -> Result<Arc<Upstream>, GatewayError> {
        let url = Url::parse(raw_url)
            .map_err(|err| GatewayError::Config(format!("invalid upstream {raw_url}: {err}")))?;
        let key = url.to_string();
        if let Some(existing) = self.upstreams.get(&key) {
            return Ok(existing.clone());
        }

        let health_path = if health_path.is_empty() {
            "/healthz"
        } else {
            health_path
        };
        let upstream = Arc::new(Upstream::new(url, health_path));
        self.upstreams.insert(key, upstream.clone());
        Ok(upstream)
    }

    /// All upstreams, ordered by URL for deterministic output.
    pub fn all(&self) -> Vec<Arc<Upstream>> {
        let mut entries: Vec<_> = self.upstreams.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, up)| up.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

fn authority(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

fn to_chrono(duration: Duration) -> ChronoDuration {
    // Config durations are seconds-scale; cap absurd values at a day.
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(86_400))
}
