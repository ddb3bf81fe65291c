//! Sized, ranged reads of objects on HTTP(S) servers.

use crate::error::FetchError;

use bytes::Bytes;
use std::time::Duration;
use url::Url;

/// HTTP source reader.
#[derive(Clone, Debug)]
pub struct HttpClient {
    reqwest_client: reqwest::Client,
}

impl HttpClient {
    /// Create a new HTTP client.
    ///
    /// # Arguments
    ///
    /// * `timeout`: Per-request timeout
    pub fn new(timeout: Duration) -> Self {
        let reqwest_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { reqwest_client }
    }

    /// Returns the size of the object at `url` from a HEAD request.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn object_size(&self, url: &Url) -> Result<u64, FetchError> {
        let response = self
            .reqwest_client
            .head(url.as_str())
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, err))?;
        check_status(url, response.status())?;
        response
            .content_length()
            .ok_or_else(|| FetchError::permanent(url, "response has no content length"))
    }

    /// Downloads `len` bytes starting at `offset`.
    ///
    /// Servers that ignore the Range header and return the whole object are tolerated.
    #[tracing::instrument(level = "DEBUG", skip(self))]
    pub async fn download_range(&self, url: &Url, offset: u64, len: u64) -> Result<Bytes, FetchError> {
        let mut request = self.reqwest_client.get(url.as_str());
        if len > 0 {
            let range_header_value = format!("bytes={}-{}", offset, offset + len - 1);
            request = request.header(reqwest::header::RANGE, range_header_value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| classify_reqwest_error(url, err))?;
        let status = response.status();
        check_status(url, status)?;
        let body = response
            .bytes()
            .await
            .map_err(|err| classify_reqwest_error(url, err))?;
        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            return Ok(body);
        }
        let start = usize::try_from(offset).map_err(|err| FetchError::permanent(url, err))?;
        let end = start + usize::try_from(len).map_err(|err| FetchError::permanent(url, err))?;
        if body.len() < end {
            return Err(FetchError::transient(
                url,
                format!("short body: {} < {}", body.len(), end),
            ));
        }
        Ok(body.slice(start..end))
    }
}

/// Sorts a response status into success, transient or permanent failure.
pub fn check_status(url: &Url, status: reqwest::StatusCode) -> Result<(), FetchError> {
    let reason = format!("HTTP request failed with status: {}", status);
    if status.is_success() {
        Ok(())
    } else if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        Err(FetchError::transient(url, reason))
    } else {
        Err(FetchError::permanent(url, reason))
    }
}

/// Request building failures are permanent, everything on the wire is worth retrying.
fn classify_reqwest_error(url: &Url, err: reqwest::Error) -> FetchError {
    match err.status() {
        Some(status) => match check_status(url, status) {
            Err(err) => err,
            Ok(()) => FetchError::transient(url, err),
        },
        None if err.is_builder() => FetchError::permanent(url, err),
        None => FetchError::transient(url, err),
    }
}
