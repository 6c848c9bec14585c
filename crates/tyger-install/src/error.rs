//! Installer error types

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced while provisioning an environment
///
/// A resolved promise hands the same result to every awaiter, so this type is
/// `Clone`. Sources that are not clonable are kept behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum InstallError {
    /// A prerequisite step failed. The root cause was reported where it happened.
    #[error("dependency failed")]
    DependencyFailed,

    /// A human-readable error has already been emitted; only the exit status is left to set.
    #[error("already logged error")]
    AlreadyLogged,

    #[error("operation cancelled")]
    Cancelled,

    /// The task running a step ended without producing a result (it panicked).
    #[error("provisioning task ended without producing a result")]
    Abandoned,

    /// A programmer error, e.g. a graph wired against a resource that validation should have required.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{step}: {message}")]
    Provision { step: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
}

impl InstallError {
    pub fn provision(step: impl Into<String>, message: impl ToString) -> Self {
        InstallError::Provision {
            step: step.into(),
            message: message.to_string(),
        }
    }

    pub fn is_dependency_failed(&self) -> bool {
        matches!(self, InstallError::DependencyFailed)
    }

    pub fn is_already_logged(&self) -> bool {
        matches!(self, InstallError::AlreadyLogged)
    }

    /// Whether this error is a cause that still has to be reported
    pub fn is_root_cause(&self) -> bool {
        !self.is_dependency_failed() && !self.is_already_logged()
    }
}

impl From<std::io::Error> for InstallError {
    fn from(err: std::io::Error) -> Self {
        InstallError::Io(Arc::new(err))
    }
}

pub type Result<T> = std::result::Result<T, InstallError>;

/// Errors raised while loading or narrowing a configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("the `kind` field is required in the config file")]
    MissingKind,

    #[error("unsupported config kind '{0}', expected 'azureCloud'")]
    UnsupportedKind(String),

    #[error("{0}")]
    Organization(String),
}

impl From<ConfigError> for InstallError {
    fn from(err: ConfigError) -> Self {
        InstallError::InvalidConfig(err.to_string())
    }
}
