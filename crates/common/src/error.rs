//! Error kinds for the lease manager, expressed as a single `thiserror` enum
//! rather than the scattered exception hierarchy of the original source
//! (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid date `{date}` (expected format `{expected_format}`)")]
    InvalidDate { date: String, expected_format: String },

    #[error("invalid period: {0}")]
    InvalidPeriod(String),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("malformed parameter: {0}")]
    MalformedParameter(String),

    #[error("malformed requirements: {0}")]
    MalformedRequirements(String),

    #[error("missing trust id")]
    MissingTrustId,

    #[error("lease name `{0}` already exists in this project")]
    LeaseNameAlreadyExists(String),

    #[error("unsupported resource type `{0}`")]
    UnsupportedResourceType(String),

    #[error("not enough resources available: {reason}")]
    NotEnoughResourcesAvailable { reason: String, retried_without_defaults: bool },

    #[error("cannot update parameter `{0}`")]
    CantUpdateParameter(String),

    #[error("plugin configuration error: {0}")]
    PluginConfigurationError(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("event error: {0}")]
    EventError(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

impl ManagerError {
    /// Validation-style errors that the status machine guard (spec §4.6)
    /// must treat as non-fatal: they leave the lease in its pre-call
    /// stable state rather than landing it in ERROR.
    pub fn is_non_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvalidDate { .. }
                | Self::InvalidPeriod(_)
                | Self::InvalidRange(_)
                | Self::MissingParameter(_)
                | Self::MalformedParameter(_)
                | Self::MalformedRequirements(_)
                | Self::MissingTrustId
                | Self::LeaseNameAlreadyExists(_)
                | Self::UnsupportedResourceType(_)
                | Self::NotEnoughResourcesAvailable { .. }
                | Self::CantUpdateParameter(_)
                | Self::NotAuthorized(_)
        )
    }

    /// Used by the event engine's retry decision (spec §4.3 step 5): only
    /// `InvalidStatus` failures get the retry-within-window treatment.
    pub fn is_invalid_status(&self) -> bool {
        matches!(self, Self::InvalidStatus(_))
    }
}

/// Wraps whatever the concrete backend's error type is (`sqlx::Error` for
/// the Postgres repository). Kept as a string here so `leasemgr-common`
/// never has to depend on a storage backend crate.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, ManagerError>;
