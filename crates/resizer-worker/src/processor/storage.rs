//! Object storage for resized images (S3 and S3-compatible services).

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::BehaviorVersion,
    error::SdkError,
    operation::head_object::HeadObjectError,
    presigning::PresigningConfig,
    primitives::ByteStream,
};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("invalid presign expiry: {0}")]
    Presign(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Time-limited GET URL for `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError>;
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, LocalStack, ...). Forces path-style addressing.
    pub endpoint: Option<String>,
}

pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Credentials come from the usual AWS provider chain.
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(aws_sdk_s3::config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(ref endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        info!(bucket = %config.bucket, endpoint = ?config.endpoint, "S3 client configured");
        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(ref err) if is_not_found_head_error(err) => Ok(false),
            Err(err) => Err(map_sdk_error(err)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(map_sdk_error)?;
        debug!(key, size, "object uploaded");
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, StorageError> {
        let presigning =
            PresigningConfig::expires_in(expires_in).map_err(|e| StorageError::Presign(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(map_sdk_error)?;
        Ok(request.uri().to_string())
    }
}

/// Checks if a `HeadObject` error is a "not found" error.
fn is_not_found_head_error(err: &SdkError<HeadObjectError>) -> bool {
    if let SdkError::ServiceError(service_err) = err {
        if matches!(service_err.err(), HeadObjectError::NotFound(_)) {
            return true;
        }
        // Also check HTTP status code for 404
        if service_err.raw().status().as_u16() == 404 {
            return true;
        }
    }
    false
}

fn map_sdk_error<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    if let SdkError::DispatchFailure(ref dispatch_err) = err
        && (dispatch_err.is_io() || dispatch_err.is_timeout())
    {
        return StorageError::Connection(format!("{}", aws_sdk_s3::error::DisplayErrorContext(&err)));
    }
    StorageError::S3(format!("{}", aws_sdk_s3::error::DisplayErrorContext(&err)))
}
