//! Cloud provisioner trait definition
//!
//! The installer only decides *what* runs *when*. Each leaf step is an opaque
//! async call on a [`CloudProvisioner`], which owns the cloud API (or CLI)
//! details, its own retries, and the configuration it was built from.

use crate::config::{
    ClusterConfig, DatabaseServerConfig, OrganizationConfig, StorageAccountConfig,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cloud provisioner abstraction trait
///
/// Every method receives the cancellation token of the install. Methods that
/// create resources are idempotent: calling them for a resource that already
/// exists in the desired shape succeeds.
#[async_trait]
pub trait CloudProvisioner: Send + Sync {
    /// Returns the provisioner name (e.g., "azure-cli")
    fn name(&self) -> &str;

    /// Check if the provisioner is properly configured and authenticated
    async fn check_auth(&self, token: &CancellationToken) -> Result<AuthStatus>;

    async fn ensure_resource_group(
        &self,
        token: &CancellationToken,
        name: &str,
        location: &str,
    ) -> Result<()>;

    async fn delete_resource_group(&self, token: &CancellationToken, name: &str) -> Result<()>;

    async fn create_cluster(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<ClusterHandle>;

    /// Look up a cluster created by the shared wave
    async fn get_cluster(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<ClusterHandle>;

    async fn delete_cluster(&self, token: &CancellationToken, cluster: &ClusterConfig)
    -> Result<()>;

    async fn get_admin_credentials(
        &self,
        token: &CancellationToken,
        cluster: &ClusterHandle,
    ) -> Result<AdminCredentials>;

    /// Bind the management principals to cluster roles
    async fn create_cluster_rbac(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> Result<()>;

    async fn create_database_server(
        &self,
        token: &CancellationToken,
        database: &DatabaseServerConfig,
    ) -> Result<DatabaseServerHandle>;

    async fn create_managed_identity(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        name: &str,
    ) -> Result<IdentityHandle>;

    /// Delete identities in `resource_group` whose names are not in `keep`
    async fn delete_unused_identities(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        keep: &[String],
    ) -> Result<()>;

    /// Trust tokens issued to `namespace`'s service account of the same name
    async fn create_federated_identity_credential(
        &self,
        token: &CancellationToken,
        identity: &IdentityHandle,
        cluster: &ClusterHandle,
        namespace: &str,
    ) -> Result<()>;

    async fn grant_key_vault_access(
        &self,
        token: &CancellationToken,
        identity: &IdentityHandle,
    ) -> Result<()>;

    async fn remove_key_vault_access(&self, token: &CancellationToken) -> Result<()>;

    /// Create a namespace and return its name
    async fn create_namespace(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        name: &str,
    ) -> Result<String>;

    async fn delete_namespace(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        name: &str,
    ) -> Result<()>;

    async fn create_namespace_rbac(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        namespace: &str,
    ) -> Result<()>;

    /// Expose the Key Vault TLS certificate to pods in `namespace` through the CSI secrets store
    async fn create_secret_provider_class(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        namespace: &str,
        identity: &IdentityHandle,
        certificate_name: &str,
    ) -> Result<()>;

    /// Install Traefik; with a Key Vault identity it mounts the certificate
    async fn install_traefik(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        key_vault_identity: Option<&IdentityHandle>,
    ) -> Result<()>;

    async fn install_cert_manager(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> Result<()>;

    async fn install_nvidia_device_plugin(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> Result<()>;

    /// Create a storage account and grant `server_identity` data access to it
    async fn create_storage_account(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        account: &StorageAccountConfig,
        server_identity: &IdentityHandle,
    ) -> Result<()>;

    /// Create the organization's database and its roles on the shared server
    async fn create_database(
        &self,
        token: &CancellationToken,
        org: &OrganizationConfig,
        server_identity: &IdentityHandle,
        migration_identity: &IdentityHandle,
    ) -> Result<()>;

    async fn delete_database(&self, token: &CancellationToken, org: &OrganizationConfig)
    -> Result<()>;

    async fn assign_dns_record(&self, token: &CancellationToken, org: &OrganizationConfig)
    -> Result<()>;

    async fn delete_dns_record(&self, token: &CancellationToken, org: &OrganizationConfig)
    -> Result<()>;
}

/// Authentication status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatus {
    /// Whether authentication is valid
    pub authenticated: bool,

    /// Account/user information if available
    pub account_info: Option<String>,

    /// Error message if not authenticated
    pub error: Option<String>,
}

impl AuthStatus {
    pub fn ok(account_info: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            account_info: Some(account_info.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            account_info: None,
            error: Some(error.into()),
        }
    }
}

/// A provisioned Kubernetes cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    pub name: String,
    pub resource_group: String,
    pub location: String,
    pub oidc_issuer_url: String,
    pub api_host: bool,
}

/// Cluster-admin access to a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub cluster_name: String,

    /// Kubeconfig file holding the admin context
    pub kubeconfig: PathBuf,
}

/// A user-assigned managed identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHandle {
    pub name: String,
    pub resource_group: String,
    pub client_id: String,
    pub principal_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseServerHandle {
    pub name: String,
    pub fqdn: String,
}

/// Retry configuration for provider operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or runs out of attempts
///
/// Cancellation during a backoff sleep returns the last error.
pub async fn retry_transient<T, E, F, Fut>(
    token: &CancellationToken,
    config: &RetryConfig,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if attempt >= config.max_attempts || !is_transient(&err) {
            return Err(err);
        }

        let delay = config.delay_for(attempt);
        tracing::warn!(attempt, ?delay, "Transient failure, retrying: {}", err);
        tokio::select! {
            _ = token.cancelled() => return Err(err),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
