//! Azure provisioner for the Tyger cloud installer
//!
//! Implements [`tyger_install::CloudProvisioner`] by driving the `az`,
//! `kubectl` and `helm` CLIs.
//!
//! # Requirements
//!
//! - `az` must be installed and logged in (`az login`)
//! - `kubectl` and `helm` must be on the PATH
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tyger_install::{CloudEnvironmentConfig, Installer};
//! use tyger_install_azure::AzureCliProvisioner;
//!
//! let config = CloudEnvironmentConfig::load("tyger.yml")?;
//! let provisioner = Arc::new(AzureCliProvisioner::new(config.clone())?);
//! let installer = Installer::new(config, provisioner);
//!
//! installer.install_cloud(&token, false).await?;
//! ```

pub mod cli;
pub mod error;
pub mod provider;

pub use cli::{AzureCli, CommandRunner, ProcessRunner};
pub use error::{AzureError, Result};
pub use provider::AzureCliProvisioner;
