//! A simplified S3 client that supports sized, ranged object reads.
//! It attempts to hide the complexities of working with the AWS SDK for S3.

use crate::error::FetchError;

use aws_credential_types::Credentials;
use aws_sdk_s3::config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::http::Response as HttpResponse;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::region::Region;
use axum::body::Bytes;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::Instrument;
use url::Url;

/// S3 error codes that no retry can fix.
const PERMANENT_CODES: [&str; 5] = [
    "NoSuchKey",
    "NoSuchBucket",
    "AccessDenied",
    "InvalidAccessKeyId",
    "NotFound",
];

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum S3Credentials {
    AccessKey {
        access_key: String,
        secret_key: String,
    },
    None,
}

impl S3Credentials {
    /// Create an access key credential.
    pub fn access_key(access_key: &str, secret_key: &str) -> Self {
        S3Credentials::AccessKey {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
        }
    }
}

/// A map containing initialised S3Client objects.
///
/// The [aws_sdk_s3::Client] object is relatively expensive to create, so we reuse them where
/// possible. This type provides a map for storing the clients objects.
///
/// The map's key is a 2-tuple of the S3 URL and credentials.
/// The value is the corresponding client object.
#[derive(Debug, Default)]
pub struct S3ClientMap {
    /// A [hashbrown::HashMap] for storing the S3 clients. A read-write lock synchronises access to
    /// the map, optimised for reads.
    map: RwLock<HashMap<(Url, S3Credentials), S3Client>>,
}

impl S3ClientMap {
    /// Create and return an [crate::s3_client::S3ClientMap].
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create an [crate::s3_client::S3Client] object from the map.
    ///
    /// # Arguments
    ///
    /// * `url`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub async fn get(&self, url: &Url, credentials: S3Credentials) -> S3Client {
        let key = (url.clone(), credentials.clone());
        // Common case: return an existing client from the map.
        {
            let map = self.map.read().await;
            if let Some(client) = map.get(&key) {
                return client.clone();
            }
        }
        // Less common case: create a new client, insert it into the map and return it.
        let mut map = self.map.write().await;
        // Allow for a possible race here since we dropped the read lock.
        if let Some(client) = map.get(&key) {
            client.clone()
        } else {
            tracing::info!("Creating new S3 client for {}", url);
            let client = S3Client::new(url, credentials);
            let (_, client) = map.insert_unique_unchecked(key, client);
            client.clone()
        }
    }
}

/// S3 client object.
#[derive(Clone, Debug)]
pub struct S3Client {
    /// Underlying AWS SDK S3 client object.
    client: Client,
}

impl S3Client {
    /// Creates an S3Client object
    ///
    /// # Arguments
    ///
    /// * `url`: Object storage API URL
    /// * `credentials`: Object storage account credentials
    pub fn new(url: &Url, credentials: S3Credentials) -> Self {
        let region = Region::new("us-east-1");
        let builder = aws_sdk_s3::Config::builder().behavior_version(BehaviorVersion::latest());
        let builder = match credentials {
            S3Credentials::AccessKey {
                access_key,
                secret_key,
            } => {
                let credentials = Credentials::from_keys(access_key, secret_key, None);
                builder.credentials_provider(credentials)
            }
            S3Credentials::None => builder,
        };
        let s3_config = builder
            .region(Some(region))
            .endpoint_url(url.to_string())
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(s3_config),
        }
    }

    /// Returns the size of an object in bytes.
    ///
    /// # Arguments
    ///
    /// * `location`: Rendered location, for error reporting
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    pub async fn object_size(&self, location: &str, bucket: &str, key: &str) -> Result<u64, FetchError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .instrument(tracing::Span::current())
            .await
            .map_err(|err| classify_sdk_error(location, err))?;
        let length = response
            .content_length()
            .ok_or_else(|| FetchError::permanent(location, "object has no content length"))?;
        u64::try_from(length).map_err(|err| FetchError::permanent(location, err))
    }

    /// Downloads a byte range of an object and returns the data as Bytes
    ///
    /// # Arguments
    ///
    /// * `location`: Rendered location, for error reporting
    /// * `bucket`: Name of the bucket
    /// * `key`: Name of the object in the bucket
    /// * `offset`: Offset of the range in bytes
    /// * `len`: Length of the range in bytes, greater than zero
    pub async fn download_range(
        &self,
        location: &str,
        bucket: &str,
        key: &str,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(get_range(offset, len))
            .send()
            .instrument(tracing::Span::current())
            .await
            .map_err(|err| classify_sdk_error(location, err))?;
        let body = response
            .body
            .collect()
            .instrument(tracing::Span::current())
            .await
            .map_err(|err| FetchError::transient(location, err))?;
        Ok(body.into_bytes())
    }
}

/// Sorts an SDK error into transient or permanent.
///
/// Service errors are permanent when the error code or a 4xx status says the object cannot be
/// read. Throttling, 5xx responses, timeouts and dispatch failures are transient.
pub fn classify_sdk_error<E>(location: &str, err: SdkError<E, HttpResponse>) -> FetchError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let reason = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = context.err().code();
            let permanent_code = code.is_some_and(|code| PERMANENT_CODES.contains(&code));
            if permanent_code || (400..500).contains(&status) && status != 408 && status != 429 {
                FetchError::permanent(location, reason)
            } else {
                FetchError::transient(location, reason)
            }
        }
        SdkError::ConstructionFailure(_) => FetchError::permanent(location, reason),
        _ => FetchError::transient(location, reason),
    }
}

/// Return a byte range string based on the offset and size.
///
/// The returned string is compatible with the HTTP Range header.
///
/// # Arguments
///
/// * `offset`: Offset of data in bytes
/// * `size`: Size of data in bytes, greater than zero
pub fn get_range(offset: u64, size: u64) -> Option<String> {
    // Range-end is inclusive.
    (size > 0).then(|| format!("bytes={}-{}", offset, offset + size - 1))
}
