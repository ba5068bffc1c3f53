/*!
Amazon EC2 provider adapter.

Snapshots are EC2 machine images (AMIs). Every image created here is tagged
as managed by Snapkeep, and listing only returns self-owned images carrying
that tag, so reconciliation never touches images it did not create.
*/

use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::config::Credentials as AwsCredentials;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification};
use aws_sdk_ec2::Client as Ec2Client;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Provider, ProviderError, ProviderErrorKind, ProviderResult};
use crate::config::Credentials;
use crate::Result;

/// Tag key marking images created by this engine
pub const MANAGED_TAG_KEY: &str = "snapkeep:managed";

/// Tag key recording the source instance of an image
pub const INSTANCE_TAG_KEY: &str = "snapkeep:instance-id";

/// Region used when the credentials do not name one
pub const DEFAULT_REGION: &str = "us-east-1";

const DESCRIBE_PAGE_SIZE: i32 = 1000;

/// EC2 image provider
///
/// # Example
/// ```rust,no_run
/// use snapkeep_core::config::Credentials;
/// use snapkeep_core::provider::Ec2Provider;
/// use std::time::Duration;
///
/// # async fn run() -> snapkeep_core::Result<()> {
/// let credentials = Credentials::new("AKIA...", "secret").with_region("eu-west-1");
/// let provider = Ec2Provider::connect(&credentials, Duration::from_secs(60)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Ec2Provider {
    client: Ec2Client,
    region: String,
}

impl Ec2Provider {
    /// Build a provider from caller-supplied credentials
    ///
    /// `operation_timeout` bounds every EC2 API call at the SDK level.
    pub async fn connect(credentials: &Credentials, operation_timeout: Duration) -> Result<Self> {
        credentials.validate()?;

        let region = credentials
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let aws_credentials = AwsCredentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            credentials.session_token.clone(),
            None,
            "snapkeep",
        );

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(aws_credentials)
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(operation_timeout)
                    .build(),
            )
            .load()
            .await;

        info!(region = %region, "Initialized EC2 provider");

        Ok(Self {
            client: Ec2Client::new(&sdk_config),
            region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn managed_filter() -> Filter {
        Filter::builder()
            .name(format!("tag:{MANAGED_TAG_KEY}"))
            .values("true")
            .build()
    }

    /// EBS snapshots backing an image; deregistering leaves them behind
    async fn backing_snapshots(&self, image_id: &str) -> ProviderResult<Vec<String>> {
        let output = self
            .client
            .describe_images()
            .image_ids(image_id)
            .send()
            .await
            .map_err(|e| map_ec2_error("describe_images", e))?;

        let image = output
            .images()
            .first()
            .ok_or_else(|| {
                ProviderError::not_found(format!("image '{image_id}' does not exist"))
            })?;

        Ok(image
            .block_device_mappings()
            .iter()
            .filter_map(|mapping| mapping.ebs())
            .filter_map(|ebs| ebs.snapshot_id())
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl Provider for Ec2Provider {
    async fn create_image(&self, instance_id: &str, name: &str) -> ProviderResult<String> {
        info!(region = %self.region, instance_id, name, "Creating EC2 image");

        let tags = TagSpecification::builder()
            .resource_type(ResourceType::Image)
            .tags(Tag::builder().key(MANAGED_TAG_KEY).value("true").build())
            .tags(Tag::builder().key(INSTANCE_TAG_KEY).value(instance_id).build())
            .build();

        let output = self
            .client
            .create_image()
            .instance_id(instance_id)
            .name(name)
            .description(format!("Snapkeep backup of {instance_id}"))
            .no_reboot(true)
            .tag_specifications(tags)
            .send()
            .await
            .map_err(|e| map_ec2_error("create_image", e))?;

        let image_id = output
            .image_id()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::permanent("EC2 create_image returned no image id"))?;

        debug!(instance_id, image_id = %image_id, "EC2 image created");
        Ok(image_id)
    }

    async fn delete_image(&self, image_id: &str) -> ProviderResult<()> {
        info!(region = %self.region, image_id, "Deregistering EC2 image");

        let snapshots = self.backing_snapshots(image_id).await?;

        self.client
            .deregister_image()
            .image_id(image_id)
            .send()
            .await
            .map_err(|e| map_ec2_error("deregister_image", e))?;

        for snapshot_id in snapshots {
            match self
                .client
                .delete_snapshot()
                .snapshot_id(&snapshot_id)
                .send()
                .await
            {
                Ok(_) => debug!(
                    image_id,
                    snapshot_id = %snapshot_id,
                    "Deleted backing EBS snapshot"
                ),
                Err(e) => warn!(
                    image_id,
                    snapshot_id = %snapshot_id,
                    error = %map_ec2_error("delete_snapshot", e),
                    "Failed to delete backing EBS snapshot"
                ),
            }
        }

        Ok(())
    }

    async fn list_images(&self) -> ProviderResult<BTreeSet<String>> {
        let mut ids = BTreeSet::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .describe_images()
                .owners("self")
                .filters(Self::managed_filter())
                .max_results(DESCRIBE_PAGE_SIZE)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| map_ec2_error("describe_images", e))?;

            ids.extend(
                output
                    .images()
                    .iter()
                    .filter_map(|image| image.image_id())
                    .map(str::to_string),
            );

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(region = %self.region, count = ids.len(), "Listed managed EC2 images");
        Ok(ids)
    }

    async fn find_image_by_name(&self, name: &str) -> ProviderResult<Option<String>> {
        let output = self
            .client
            .describe_images()
            .owners("self")
            .filters(Self::managed_filter())
            .filters(Filter::builder().name("name").values(name).build())
            .send()
            .await
            .map_err(|e| map_ec2_error("describe_images", e))?;

        Ok(output
            .images()
            .iter()
            .find_map(|image| image.image_id())
            .map(str::to_string))
    }
}

/// Classify an EC2 API error code
fn classify_error_code(code: &str) -> ProviderErrorKind {
    match code {
        "RequestLimitExceeded"
        | "Throttling"
        | "ThrottlingException"
        | "InternalError"
        | "InternalFailure"
        | "ServiceUnavailable"
        | "Unavailable"
        | "RequestTimeout" => ProviderErrorKind::Transient,
        "InvalidAMIID.NotFound" | "InvalidAMIID.Unavailable" => ProviderErrorKind::NotFound,
        _ => ProviderErrorKind::Permanent,
    }
}

/// Map AWS SDK errors to ProviderError with appropriate context
fn map_ec2_error<E>(op: &str, error: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match &error {
        SdkError::TimeoutError(_) => {
            ProviderError::transient(format!("EC2 {op} request timed out"))
        }
        SdkError::DispatchFailure(dispatch_err) => ProviderError::transient(format!(
            "EC2 {op} request failed to dispatch: {dispatch_err:?}"
        )),
        SdkError::ResponseError(response_err) => {
            ProviderError::transient(format!("EC2 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or("Unknown");
            let message = service_err.err().message().unwrap_or("Unknown error");
            ProviderError {
                kind: classify_error_code(code),
                message: format!("EC2 {op} service error ({code}): {message}"),
            }
        }
        _ => ProviderError::permanent(format!("EC2 {op} error: {error}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttling_is_transient() {
        assert_eq!(
            classify_error_code("RequestLimitExceeded"),
            ProviderErrorKind::Transient
        );
        assert_eq!(
            classify_error_code("InternalError"),
            ProviderErrorKind::Transient
        );
    }

    #[test]
    fn test_missing_image_is_not_found() {
        assert_eq!(
            classify_error_code("InvalidAMIID.NotFound"),
            ProviderErrorKind::NotFound
        );
        assert_eq!(
            classify_error_code("InvalidAMIID.Unavailable"),
            ProviderErrorKind::NotFound
        );
    }

    #[test]
    fn test_auth_and_bad_instance_are_permanent() {
        for code in [
            "UnauthorizedOperation",
            "AuthFailure",
            "InvalidInstanceID.NotFound",
            "InvalidInstanceID.Malformed",
            "InvalidAMIName.Duplicate",
        ] {
            assert_eq!(classify_error_code(code), ProviderErrorKind::Permanent);
        }
    }
}
