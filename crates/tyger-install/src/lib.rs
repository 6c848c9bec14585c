//! Tyger Cloud Installer
//!
//! This crate provisions a Tyger environment as a graph of interdependent
//! steps. Every step is a [`Promise`] that starts running as soon as it is
//! created and waits only for the steps it depends on, so independent work
//! (clusters, database server, identities, storage accounts) proceeds in
//! parallel while ordering constraints still hold.
//!
//! # Waves
//!
//! Steps are collected into a [`PromiseGroup`] per wave. The shared wave must
//! fully succeed before the organization waves start; organization waves run
//! concurrently with each other. Draining a wave logs each root-cause failure
//! exactly once. Steps that never ran because a prerequisite failed resolve to
//! [`InstallError::DependencyFailed`] and are not reported again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                 tyger-install CLI                │
//! │          (cloud install / cloud uninstall)       │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                 tyger-install                    │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  Installer: shared wave → org waves       │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐  ┌──────────────┐            │
//! │  │ Promise/Group │  │ Config/Valid │            │
//! │  └──────────────┘  └──────────────┘            │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait CloudProvisioner { ... }           │   │
//! │  └──────────────────────────────────────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!           ┌───────▼───────┐
//!           │  azure (az,   │
//!           │ kubectl, helm)│
//!           └───────────────┘
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod installer;
pub mod promise;
pub mod provider;
pub mod report;
pub mod validation;

// Re-exports
pub use config::CloudEnvironmentConfig;
pub use error::{ConfigError, InstallError, Result};
pub use group::PromiseGroup;
pub use installer::Installer;
pub use promise::{Awaitable, Dependency, Promise, PromiseState};
pub use provider::{
    AdminCredentials, AuthStatus, CloudProvisioner, ClusterHandle, DatabaseServerHandle,
    IdentityHandle, RetryConfig, retry_transient,
};
pub use report::{WaveReport, log_error};
pub use validation::{quick_validate, validate};
