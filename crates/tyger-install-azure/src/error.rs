//! Azure provisioner error types

use thiserror::Error;
use tyger_install::InstallError;

#[derive(Error, Debug)]
pub enum AzureError {
    #[error("{0} not found. Please install it and make sure it is on the PATH")]
    CliNotFound(String),

    #[error("Azure CLI authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Unexpected output: {0}")]
    UnexpectedOutput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Markers the Azure CLI prints for failures worth retrying
const TRANSIENT_MARKERS: &[&str] = &[
    "TooManyRequests",
    "RetryableError",
    "AnotherOperationInProgress",
    "OperationNotAllowed: Operation is not allowed because there's an in progress",
    "InternalServerError",
    "ServiceUnavailable",
    "GatewayTimeout",
];

const NOT_FOUND_MARKERS: &[&str] = &[
    "ResourceNotFound",
    "ResourceGroupNotFound",
    "(NotFound)",
    "Code: NotFound",
    "was not found",
    "could not be found",
];

impl AzureError {
    pub fn is_transient(&self) -> bool {
        match self {
            AzureError::CommandFailed { stderr, .. } => {
                TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m))
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            AzureError::NotFound(_) => true,
            AzureError::CommandFailed { stderr, .. } => {
                NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m))
            }
            _ => false,
        }
    }

    /// The caller may read but not delete at this scope
    pub fn is_authorization_failed(&self) -> bool {
        matches!(self, AzureError::CommandFailed { stderr, .. } if stderr.contains("AuthorizationFailed"))
    }

    /// Attach the installer step this error happened in
    pub fn in_step(self, step: impl Into<String>) -> InstallError {
        match self {
            AzureError::Cancelled => InstallError::Cancelled,
            err => InstallError::provision(step, err),
        }
    }
}

impl From<AzureError> for InstallError {
    fn from(err: AzureError) -> Self {
        err.in_step("azure")
    }
}

pub type Result<T> = std::result::Result<T, AzureError>;
