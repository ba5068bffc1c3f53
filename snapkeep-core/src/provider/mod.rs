/*!
Provider port for creating, deleting and listing machine images.

The engine only depends on the [`Provider`] trait. Concrete adapters talk to
a cloud control plane ([`Ec2Provider`], behind the `ec2` feature) or keep the
images in process ([`MemoryProvider`]).
*/

#[cfg(feature = "ec2")]
pub mod ec2;
pub mod memory;

use async_trait::async_trait;
use snapkeep_retry::RetryableError;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[cfg(feature = "ec2")]
pub use ec2::Ec2Provider;
pub use memory::MemoryProvider;

/// How a provider failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Timeouts, throttling, connection failures; worth retrying
    Transient,
    /// Invalid ids, permission problems; retrying cannot help
    Permanent,
    /// The image does not exist (or no longer exists)
    NotFound,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::NotFound => "not found",
        };
        f.write_str(label)
    }
}

/// Error reported by a provider adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({kind})")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    /// Create a transient error
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: msg.into(),
        }
    }

    /// Create a permanent error
    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self {
            kind: ProviderErrorKind::NotFound,
            message: msg.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }
}

impl RetryableError for ProviderError {
    fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }
}

/// Result type for provider calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Machine image capability consumed by the engine
///
/// Credentials are bound when an adapter is constructed; the engine never
/// sees them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Create an image of `instance_id` named `name`, returning the image id
    async fn create_image(&self, instance_id: &str, name: &str) -> ProviderResult<String>;

    /// Delete an image
    ///
    /// # Errors
    /// Returns a [`ProviderErrorKind::NotFound`] error when the image is
    /// already gone.
    async fn delete_image(&self, image_id: &str) -> ProviderResult<()>;

    /// List the ids of every image this engine manages
    async fn list_images(&self) -> ProviderResult<BTreeSet<String>>;

    /// Look up a managed image by the name it was created with
    async fn find_image_by_name(&self, name: &str) -> ProviderResult<Option<String>>;
}
