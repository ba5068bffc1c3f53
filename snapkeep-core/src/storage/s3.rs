/*!
Amazon S3 document store.

The catalog document is kept as a single S3 object. Transient S3 failures
are retried through `snapkeep-retry`; a missing object reads as an empty
catalog.
*/

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use snapkeep_retry::{with_policy, RetryError, RetryPolicy, RetryableError};
use thiserror::Error;
use tracing::{debug, error, info};

use super::DocumentStore;
use crate::config::CatalogConfig;
use crate::{Result, SnapkeepError};

/// Catalog document stored as an S3 object
///
/// # Authentication
/// The store uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::config::CatalogConfig;
/// use snapkeep_core::storage::S3DocumentStore;
///
/// # async fn run() -> snapkeep_core::Result<()> {
/// let config = CatalogConfig::from_uri("s3://my-backups/snapkeep/catalog.json")?;
/// let store = S3DocumentStore::connect(&config).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3DocumentStore {
    client: S3Client,
    bucket: String,
    key: String,
    retry: RetryPolicy,
}

impl S3DocumentStore {
    /// Create a store for the bucket and key named by `config`
    pub async fn connect(config: &CatalogConfig) -> Result<Self> {
        config.validate()?;
        let bucket = config
            .s3_bucket
            .clone()
            .ok_or_else(|| SnapkeepError::config("S3 catalog backend requires a bucket"))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.s3_region {
            loader = loader.region(Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(SnapkeepError::storage(
                "AWS credentials not found. Please set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY",
            ));
        }

        let key = config.s3_key();
        info!(bucket = %bucket, key = %key, "Initialized S3 catalog store");

        Ok(Self::with_client(S3Client::new(&sdk_config), bucket, key))
    }

    /// Wrap an already configured S3 client
    pub fn with_client(client: S3Client, bucket: String, key: String) -> Self {
        Self {
            client,
            bucket,
            key,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn load_once(&self) -> std::result::Result<Option<Vec<u8>>, StoreFailure> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e)
                if e.as_service_error()
                    .map_or(false, |service_err| service_err.is_no_such_key()) =>
            {
                debug!(bucket = %self.bucket, key = %self.key, "Catalog object does not exist yet");
                return Ok(None);
            }
            Err(e) => return Err(map_s3_error("get_object", e, &self.key)),
        };

        let data = output.body.collect().await.map_err(|e| StoreFailure {
            transient: true,
            message: format!("Failed to read S3 object stream: {e}"),
        })?;

        Ok(Some(data.into_bytes().to_vec()))
    }

    async fn save_once(&self, data: &[u8]) -> std::result::Result<(), StoreFailure> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type("application/json")
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, &self.key))?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for S3DocumentStore {
    async fn load(&self) -> Result<Option<Vec<u8>>> {
        debug!(bucket = %self.bucket, key = %self.key, "Loading catalog from S3");
        with_policy("s3_get_object", &self.retry, |_| self.load_once())
            .await
            .map_err(|e| self.failed("load", e))
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        debug!(bucket = %self.bucket, key = %self.key, size = data.len(), "Saving catalog to S3");
        with_policy("s3_put_object", &self.retry, |_| self.save_once(data))
            .await
            .map_err(|e| self.failed("save", e))
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

impl S3DocumentStore {
    fn failed(&self, action: &str, err: RetryError<StoreFailure>) -> SnapkeepError {
        error!(bucket = %self.bucket, key = %self.key, error = %err, "Failed to {action} catalog");
        SnapkeepError::storage(err.to_string())
    }
}

/// A single failed S3 request
#[derive(Error, Debug)]
#[error("{message}")]
struct StoreFailure {
    transient: bool,
    message: String,
}

impl RetryableError for StoreFailure {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Map AWS SDK errors to a store failure with appropriate context
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(
    op: &str,
    error: SdkError<E>,
    key: &str,
) -> StoreFailure {
    let (transient, message) = match &error {
        SdkError::DispatchFailure(dispatch_err) => (
            true,
            format!("S3 {op} request failed to dispatch: {dispatch_err:?}"),
        ),
        SdkError::TimeoutError(_) => (true, format!("S3 {op} request timed out (key: {key})")),
        SdkError::ResponseError(response_err) => {
            (true, format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or("Unknown");
            match code {
                "NoSuchBucket" => (false, "S3 bucket not found".to_string()),
                "AccessDenied" | "Forbidden" => (
                    false,
                    "Access denied to S3 (check credentials and permissions)".to_string(),
                ),
                "InvalidBucketName" => (false, "Invalid S3 bucket name".to_string()),
                "SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout" => (
                    true,
                    format!("S3 {op} temporarily unavailable ({code})"),
                ),
                _ => (
                    false,
                    format!(
                        "S3 service error ({code}): {}",
                        service_err.err().message().unwrap_or("Unknown error")
                    ),
                ),
            }
        }
        _ => (false, format!("S3 {op} error: {error}")),
    };

    StoreFailure { transient, message }
}
