use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::header::CONTENT_TYPE;
use url::Url;

use crate::{
    error::{ImageGenError, Result},
    http_client::http_client,
};

/// Mime type assumed when the backend does not name one
pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// Raw image payload as served by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl FetchedImage {
    /// Inline `data:` URI carrying the full payload
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.bytes))
    }
}

/// Retrieves output images over HTTP
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    http: reqwest::Client,
}

impl ImageFetcher {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built
    pub fn new() -> Result<Self> {
        Ok(Self { http: http_client()? })
    }

    /// Download the image at `url`
    ///
    /// # Errors
    ///
    /// Returns `FetchFailed` on a non-success status, `ConnectionError` if
    /// the request or body transfer fails
    pub async fn fetch(&self, url: &Url) -> Result<FetchedImage> {
        let response = self.http.get(url.clone()).send().await.map_err(|e| {
            tracing::error!(error = %e, "image fetch failed");
            ImageGenError::ConnectionError(format!("failed to fetch generated image: {e}"))
        })?;

        let status = response.status();

        if !status.is_success() {
            tracing::error!(status = %status, "backend refused image download");
            return Err(ImageGenError::FetchFailed {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown error").to_owned(),
            });
        }

        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_owned();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ImageGenError::ConnectionError(format!("failed to read generated image: {e}")))?;

        tracing::debug!(bytes = bytes.len(), mime_type = %mime_type, "fetched generated image");

        Ok(FetchedImage {
            bytes: bytes.to_vec(),
            mime_type,
        })
    }
}
