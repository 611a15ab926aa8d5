use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};

pub const TIMEOUT_ENV: &str = "DNS01_HTTP_TIMEOUT_SECS";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

pub struct HttpClient;

impl HttpClient {
    /// Process-wide blocking client shared by provider adapters and notifiers.
    pub fn shared() -> &'static Client {
        static CLIENT: OnceLock<Client> = OnceLock::new();
        CLIENT.get_or_init(|| {
            let timeout = resolve_timeout();
            Client::builder()
                .timeout(timeout)
                .user_agent(concat!("dns01-issuer/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|err| {
                    warn!("[dns-http] failed to build shared client: {err}");
                    Client::new()
                })
        })
    }
}

pub fn bearer(request: RequestBuilder, token: &str) -> RequestBuilder {
    request
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
}

/// Turns a non-success response into an error, consuming the body for context.
pub fn ensure_success(provider: &str, response: Response) -> anyhow::Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().ok().filter(|body| !body.trim().is_empty());
    Err(status_error(provider, status, body))
}

fn resolve_timeout() -> Duration {
    let timeout = std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[dns-http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

pub fn status_error(provider: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!("{provider} authentication failed");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!("{provider} rate limit exceeded");
    }
    if let Some(body) = body {
        return anyhow!("{provider} API error ({status}): {body}");
    }
    anyhow!("{provider} API error: {status}")
}
