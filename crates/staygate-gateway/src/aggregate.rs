//! Aggregate fan-out over the booking and payment services.

use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::GatewayError;
use crate::middleware::Pacer;

const AGGREGATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Composes one booking view from two sequential backend GETs.
///
/// Transport errors surface as `bad_gateway`; any upstream status >= 400 is
/// reshaped into `upstream_error` carrying the upstream body as the
/// message. Admissions pace through the gateway-wide [`Pacer`].
#[derive(Debug)]
pub struct Aggregator {
    client: reqwest::Client,
    booking_url: String,
    payment_url: String,
    pacer: Pacer,
}

impl Aggregator {
    pub fn new(
        booking_url: &str,
        payment_url: &str,
        rate_limit_per_minute: i64,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(AGGREGATE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Config(format!("aggregate client: {err}")))?;

        Ok(Self {
            client,
            booking_url: booking_url.trim_end_matches('/').to_owned(),
            payment_url: payment_url.trim_end_matches('/').to_owned(),
            pacer: Pacer::per_minute(rate_limit_per_minute),
        })
    }

    /// `GET {booking}/bookings/{id}` then `GET {payment}/payments/{id}`,
    /// composed as `{"booking": ..., "payment": ...}`.
    pub async fn booking_summary(&self, id: &str) -> Result<Value, GatewayError> {
        self.pacer.acquire().await;

        let booking = self
            .fetch(&format!("{}/bookings/{id}", self.booking_url))
            .await?;
        let payment = self
            .fetch(&format!("{}/payments/{id}", self.payment_url))
            .await?;

        Ok(json!({
            "booking": decode_lenient(&booking),
            "payment": decode_lenient(&payment),
        }))
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, GatewayError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GatewayError::BadGateway(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| GatewayError::BadGateway(err.to_string()))?;
        if status.as_u16() >= 400 {
            return Err(GatewayError::UpstreamError(
                String::from_utf8_lossy(&body).into_owned(),
            ));
        }
        Ok(body)
    }
}

/// Decode failures are tolerated; a malformed upstream body becomes null.
fn decode_lenient(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap_or(Value::Null)
}
