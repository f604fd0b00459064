//! Shared HTTP plumbing for REST-speaking schedulers.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tracing::debug;
use url::Url;

use super::{AdapterError, AdapterResult};
use crate::scheduler::SchedulerEndpoint;

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
            // Another crate installed one first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the client adapters share. `request_timeout` bounds each request.
pub fn build_client(request_timeout: Duration) -> crate::Result<reqwest::Client> {
    install_rustls_provider();
    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("compute-jobs/", env!("CARGO_PKG_VERSION")))
        .pool_max_idle_per_host(8);
    if request_timeout > Duration::ZERO {
        builder = builder
            .timeout(request_timeout)
            .connect_timeout(request_timeout);
    }
    Ok(builder.build()?)
}

/// Resolve `path` against the endpoint's base address.
pub fn endpoint_url(endpoint: &SchedulerEndpoint, path: &str) -> AdapterResult<Url> {
    let mut base = Url::parse(&endpoint.address).map_err(|e| {
        AdapterError::Rejected(format!(
            "invalid address '{}' for scheduler '{}': {}",
            endpoint.address, endpoint.name, e
        ))
    })?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
        .map_err(|e| AdapterError::Rejected(format!("invalid request path '{}': {}", path, e)))
}

/// Attach the endpoint's credentials.
pub fn authorize(builder: RequestBuilder, endpoint: &SchedulerEndpoint) -> RequestBuilder {
    let builder = match &endpoint.credentials.username {
        Some(user) => builder.header("X-Scheduler-User", user),
        None => builder,
    };
    match &endpoint.credentials.token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

/// Classify a transport-level failure.
pub fn classify_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        AdapterError::Transient(err.to_string())
    } else {
        AdapterError::Rejected(err.to_string())
    }
}

/// Whether a status code is worth retrying.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Map an HTTP response to success, `NotFound`, transient or rejected.
pub async fn check_response(response: Response) -> AdapterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::NOT_FOUND {
        return Err(AdapterError::NotFound);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    if is_transient_status(status) {
        Err(AdapterError::Transient(message))
    } else {
        Err(AdapterError::Rejected(message))
    }
}

/// Send a request and check its status.
pub async fn send(builder: RequestBuilder) -> AdapterResult<Response> {
    let response = builder.send().await.map_err(classify_error)?;
    check_response(response).await
}

/// Decode a JSON body; a body that does not match is a rejection.
pub async fn json<T: serde::de::DeserializeOwned>(response: Response) -> AdapterResult<T> {
    response
        .json::<T>()
        .await
        .map_err(|e| AdapterError::Rejected(format!("unexpected response body: {}", e)))
}
