//! Upstream forwarding client with idempotent retries.
//!
//! Only GET requests are retried: they are the one method family here that
//! is body-less and idempotent, so no body buffering for replay is needed.
//! Retries fire on transport errors alone; any received response is handed
//! back for the proxy core to interpret.

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::response::Response;
use http::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::Method;
use std::time::Duration;
use url::Url;

use crate::error::GatewayError;

const MAX_FORWARD_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers owned by the hop, never copied towards the upstream.
const SKIP_REQUEST_HEADERS: [HeaderName; 3] = [HOST, CONNECTION, CONTENT_LENGTH];

/// Headers describing upstream framing we replace by buffering the body.
const SKIP_RESPONSE_HEADERS: [HeaderName; 3] = [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH];

/// HTTP client used by the catch-all proxy and the auth passthrough.
#[derive(Debug, Clone)]
pub struct ForwardClient {
    client: reqwest::Client,
    retries: u32,
}

impl ForwardClient {
    pub fn new(timeout: Duration, retries: u32) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|err| GatewayError::Config(format!("proxy client: {err}")))?;

        Ok(Self { client, retries })
    }

    /// Converts an inbound request into an upstream request aimed at
    /// `target`. Query, remaining headers, and body pass through untouched.
    pub async fn prepare(
        &self,
        target: Url,
        req: Request,
    ) -> Result<reqwest::Request, GatewayError> {
        let (parts, body) = req.into_parts();
        let bytes = to_bytes(body, MAX_FORWARD_BODY_BYTES)
            .await
            .map_err(|err| GatewayError::BadRequest(format!("read request body: {err}")))?;

        let mut builder = self.client.request(parts.method, target);
        for (name, value) in &parts.headers {
            if SKIP_REQUEST_HEADERS.contains(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !bytes.is_empty() {
            builder = builder.body(bytes);
        }

        builder
            .build()
            .map_err(|err| GatewayError::Internal(format!("build upstream request: {err}")))
    }

    /// Sends the request, retrying GET transport failures with capped
    /// exponential backoff. Attempt 0 fires immediately; attempt i sleeps
    /// `min(100ms * 2^(i-1), 1s)` first.
    pub async fn execute(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let retries = if request.method() == Method::GET {
            self.retries
        } else {
            0
        };

        let mut request = request;
        let mut attempt: u32 = 0;
        loop {
            let next = if attempt < retries {
                request.try_clone()
            } else {
                None
            };
            match self.client.execute(request).await {
                Ok(response) => return Ok(response),
                Err(err) => match next {
                    Some(clone) => {
                        attempt += 1;
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        request = clone;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

/// Buffers an upstream response into a gateway response, status and body
/// forwarded verbatim.
pub async fn into_gateway_response(upstream: reqwest::Response) -> reqwest::Result<Response> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream.bytes().await?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    for (name, value) in &headers {
        if SKIP_RESPONSE_HEADERS.contains(name) {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }
    Ok(response)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(4);
    Duration::from_millis((100_u64 << exponent).min(1_000))
}
