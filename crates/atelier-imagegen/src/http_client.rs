use std::{sync::OnceLock, time::Duration};

use reqwest::{Client, header};

use crate::error::{ImageGenError, Result};

/// Common HTTP client to reuse connections to the backend
pub(crate) fn http_client() -> Result<Client> {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    if let Some(client) = CLIENT.get() {
        return Ok(client.clone());
    }

    let mut headers = header::HeaderMap::new();
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));

    let client = Client::builder()
        .timeout(Duration::from_secs(120))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
        .build()
        .map_err(|e| ImageGenError::ConnectionError(format!("failed to build HTTP client: {e}")))?;

    Ok(CLIENT.get_or_init(|| client).clone())
}
