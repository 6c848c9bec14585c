//! Install and uninstall orchestration
//!
//! An install runs in two waves. The shared wave builds what every
//! organization depends on (clusters, the database server, ingress); once it
//! has fully succeeded, one wave per organization runs, all of them
//! concurrently. Inside a wave, steps start as soon as their prerequisites
//! resolve.

use crate::config::{
    CloudEnvironmentConfig, OrganizationConfig, MIGRATION_RUNNER_IDENTITY_NAME,
    TRAEFIK_KEY_VAULT_IDENTITY_NAME, TRAEFIK_NAMESPACE, TYGER_SERVER_IDENTITY_NAME,
};
use crate::error::{InstallError, Result};
use crate::group::PromiseGroup;
use crate::promise::Promise;
use crate::provider::{AdminCredentials, CloudProvisioner, ClusterHandle, IdentityHandle};
use crate::report::{WaveReport, log_error};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Drives a [`CloudProvisioner`] through the install graphs for one environment
///
/// The configuration is expected to have passed [`crate::validation::validate`].
#[derive(Clone)]
pub struct Installer {
    config: Arc<CloudEnvironmentConfig>,
    provisioner: Arc<dyn CloudProvisioner>,
}

impl Installer {
    pub fn new(config: CloudEnvironmentConfig, provisioner: Arc<dyn CloudProvisioner>) -> Self {
        Self {
            config: Arc::new(config),
            provisioner,
        }
    }

    pub fn config(&self) -> &CloudEnvironmentConfig {
        &self.config
    }

    /// Install the shared resources (unless `skip_shared`) and then every organization
    ///
    /// The credential preflight check belongs to the shared wave and is
    /// skipped with it.
    ///
    /// Root causes are logged as they are collected. Any failure results in
    /// [`InstallError::AlreadyLogged`]; a failed shared wave stops the install
    /// before any organization is touched.
    pub async fn install_cloud(
        &self,
        token: &CancellationToken,
        skip_shared: bool,
    ) -> Result<WaveReport> {
        let mut report = WaveReport::new();
        let cloud = &self.config.cloud;

        if !skip_shared {
            self.preflight(token).await?;
            self.ensure_resource_group(token, &cloud.resource_group)
                .await?;

            if cloud.private_networking {
                for cluster in &cloud.compute.clusters {
                    if let Some(subnet) = &cluster.existing_subnet {
                        if !subnet.private_link_resource_group.is_empty() {
                            self.ensure_resource_group(token, &subnet.private_link_resource_group)
                                .await?;
                        }
                    }
                }
            }

            tracing::info!("Installing shared resources");
            let shared = self.create_shared_promises(token).wait_all().await;
            shared.log_failures();
            if !shared.is_success() {
                tracing::debug!("Shared wave failed: {}", shared);
                return Err(InstallError::AlreadyLogged);
            }
            report.merge(shared);
        }

        let provisioner = self.provisioner.clone();
        let location = cloud.default_location.clone();
        if let Err(err) = self
            .config
            .for_each_org_in_parallel(token, move |token, org| {
                let provisioner = provisioner.clone();
                let location = location.clone();
                async move {
                    provisioner
                        .ensure_resource_group(&token, &org.cloud.resource_group, &location)
                        .await
                }
            })
            .await
        {
            if !err.is_already_logged() {
                log_error(&err, "Failed to create organization resource groups");
            }
            return Err(InstallError::AlreadyLogged);
        }

        let waves: Vec<(tracing::Span, PromiseGroup)> = self
            .config
            .organizations
            .iter()
            .map(|org| {
                let span = tracing::info_span!("org", organization = %org.name);
                let group = span.in_scope(|| {
                    tracing::info!("Installing organization resources");
                    self.create_org_promises(token, org)
                });
                (span, group)
            })
            .collect();

        for (span, group) in waves {
            let wave = group.wait_all().instrument(span.clone()).await;
            span.in_scope(|| wave.log_failures());
            report.merge(wave);
        }

        tracing::debug!("Install finished: {}", report);
        if report.is_success() {
            Ok(report)
        } else {
            Err(InstallError::AlreadyLogged)
        }
    }

    /// Start every step of the shared wave and return its group
    pub fn create_shared_promises(&self, token: &CancellationToken) -> PromiseGroup {
        let mut group = PromiseGroup::new();
        let cloud = &self.config.cloud;

        let traefik_identity = cloud.tls_certificate.is_some().then(|| {
            let provisioner = self.provisioner.clone();
            let resource_group = cloud.resource_group.clone();
            Promise::new(token, &mut group, move |token| async move {
                provisioner
                    .create_managed_identity(&token, &resource_group, TRAEFIK_KEY_VAULT_IDENTITY_NAME)
                    .await
            })
        });

        {
            let provisioner = self.provisioner.clone();
            let database = cloud.database.clone();
            Promise::new(token, &mut group, move |token| async move {
                provisioner.create_database_server(&token, &database).await
            });
        }

        let mut api_host_cluster = None;
        for cluster in &cloud.compute.clusters {
            let provisioner = self.provisioner.clone();
            let config = cluster.clone();
            let promise = Promise::new(token, &mut group, move |token| async move {
                provisioner.create_cluster(&token, &config).await
            });
            if cluster.api_host {
                api_host_cluster = Some(promise);
            }
        }
        let api_host_cluster = require_api_host(token, &mut group, api_host_cluster);

        if let Some(identity) = &traefik_identity {
            self.federate(
                token,
                &mut group,
                identity,
                &api_host_cluster,
                TRAEFIK_NAMESPACE.to_string(),
            );

            let provisioner = self.provisioner.clone();
            let kv_client = identity.clone();
            Promise::<()>::after(
                token,
                &mut group,
                move |token| async move {
                    let kv_client = kv_client.wait_as_dependency().await?;
                    provisioner.grant_key_vault_access(&token, &kv_client).await
                },
                vec![identity.as_dependency()],
            );
        }

        let admin = self.admin_credentials(token, &mut group, &api_host_cluster);

        self.with_credentials(token, &mut group, &admin, |provisioner, token, credentials| async move {
            provisioner.create_cluster_rbac(&token, &credentials).await
        });

        let kv_client = traefik_identity.clone();
        let certificate_name = cloud
            .tls_certificate
            .as_ref()
            .map(|tls| tls.certificate_name.clone())
            .unwrap_or_default();
        self.with_credentials(token, &mut group, &admin, move |provisioner, token, credentials| async move {
            provisioner
                .create_namespace(&token, &credentials, TRAEFIK_NAMESPACE)
                .await?;

            let kv_client = match kv_client {
                Some(promise) => Some(promise.wait_as_dependency().await?),
                None => None,
            };
            if let Some(identity) = &kv_client {
                provisioner
                    .create_secret_provider_class(
                        &token,
                        &credentials,
                        TRAEFIK_NAMESPACE,
                        identity,
                        &certificate_name,
                    )
                    .await?;
            }
            provisioner
                .install_traefik(&token, &credentials, kv_client.as_ref())
                .await
        });

        self.with_credentials(token, &mut group, &admin, |provisioner, token, credentials| async move {
            provisioner.install_cert_manager(&token, &credentials).await
        });

        self.with_credentials(token, &mut group, &admin, |provisioner, token, credentials| async move {
            provisioner
                .install_nvidia_device_plugin(&token, &credentials)
                .await
        });

        group
    }

    /// Start every step of one organization's wave and return its group
    ///
    /// Call inside the organization's span so the steps log with it.
    pub fn create_org_promises(
        &self,
        token: &CancellationToken,
        org: &OrganizationConfig,
    ) -> PromiseGroup {
        let mut group = PromiseGroup::new();
        let resource_group = org.cloud.resource_group.clone();
        let namespace = org.cloud.kubernetes_namespace.clone();

        let server_identity =
            self.managed_identity(token, &mut group, &resource_group, TYGER_SERVER_IDENTITY_NAME);
        let migration_identity = self.managed_identity(
            token,
            &mut group,
            &resource_group,
            MIGRATION_RUNNER_IDENTITY_NAME,
        );
        let custom_identities: Vec<Promise<IdentityHandle>> = org
            .cloud
            .identities
            .iter()
            .map(|name| self.managed_identity(token, &mut group, &resource_group, name))
            .collect();

        {
            let provisioner = self.provisioner.clone();
            let resource_group = resource_group.clone();
            let mut keep = vec![
                TYGER_SERVER_IDENTITY_NAME.to_string(),
                MIGRATION_RUNNER_IDENTITY_NAME.to_string(),
            ];
            keep.extend(org.cloud.identities.iter().cloned());
            Promise::new(token, &mut group, move |token| async move {
                provisioner
                    .delete_unused_identities(&token, &resource_group, &keep)
                    .await
            });
        }

        let mut api_host_cluster = None;
        for cluster in &self.config.cloud.compute.clusters {
            let provisioner = self.provisioner.clone();
            let config = cluster.clone();
            let get_cluster = Promise::new(token, &mut group, move |token| async move {
                provisioner.get_cluster(&token, &config).await
            });

            if cluster.api_host {
                self.federate(token, &mut group, &server_identity, &get_cluster, namespace.clone());
                self.federate(token, &mut group, &migration_identity, &get_cluster, namespace.clone());
                api_host_cluster = Some(get_cluster.clone());
            }

            for identity in &custom_identities {
                self.federate(token, &mut group, identity, &get_cluster, namespace.clone());
            }
        }
        let api_host_cluster = require_api_host(token, &mut group, api_host_cluster);

        let admin = self.admin_credentials(token, &mut group, &api_host_cluster);

        let name = namespace.clone();
        let created_namespace =
            self.with_credentials(token, &mut group, &admin, move |provisioner, token, credentials| async move {
                provisioner.create_namespace(&token, &credentials, &name).await
            });

        {
            let provisioner = self.provisioner.clone();
            let credentials = admin.clone();
            let created = created_namespace.clone();
            Promise::<()>::after(
                token,
                &mut group,
                move |token| async move {
                    let credentials = credentials.wait_as_dependency().await?;
                    let namespace = created.wait_as_dependency().await?;
                    provisioner
                        .create_namespace_rbac(&token, &credentials, &namespace)
                        .await
                },
                vec![admin.as_dependency(), created_namespace.as_dependency()],
            );
        }

        let accounts = org
            .cloud
            .storage
            .logs
            .iter()
            .chain(org.cloud.storage.buffers.iter());
        for account in accounts {
            let provisioner = self.provisioner.clone();
            let resource_group = resource_group.clone();
            let account = account.clone();
            let identity = server_identity.clone();
            Promise::<()>::after(
                token,
                &mut group,
                move |token| async move {
                    let identity = identity.wait_as_dependency().await?;
                    provisioner
                        .create_storage_account(&token, &resource_group, &account, &identity)
                        .await
                },
                vec![server_identity.as_dependency()],
            );
        }

        {
            let provisioner = self.provisioner.clone();
            let org = org.clone();
            let server = server_identity.clone();
            let migration = migration_identity.clone();
            Promise::<()>::after(
                token,
                &mut group,
                move |token| async move {
                    let server = server.wait_as_dependency().await?;
                    let migration = migration.wait_as_dependency().await?;
                    provisioner
                        .create_database(&token, &org, &server, &migration)
                        .await
                },
                vec![
                    server_identity.as_dependency(),
                    migration_identity.as_dependency(),
                ],
            );
        }

        if !org.uses_built_in_domain() {
            let provisioner = self.provisioner.clone();
            let org = org.clone();
            Promise::new(token, &mut group, move |token| async move {
                provisioner.assign_dns_record(&token, &org).await
            });
        }

        group
    }

    /// Remove one organization's namespace, database, DNS record and resource group
    pub async fn uninstall_organization(
        &self,
        token: &CancellationToken,
        org: &OrganizationConfig,
    ) -> Result<()> {
        let cluster = self.config.api_host_cluster().ok_or_else(|| {
            InstallError::InvariantViolation("no cluster has `apiHost` set".to_string())
        })?;

        let cluster = self.provisioner.get_cluster(token, cluster).await?;
        let credentials = self
            .provisioner
            .get_admin_credentials(token, &cluster)
            .await?;

        tracing::info!("Deleting namespace '{}'", org.cloud.kubernetes_namespace);
        self.provisioner
            .delete_namespace(token, &credentials, &org.cloud.kubernetes_namespace)
            .await?;
        self.provisioner.delete_database(token, org).await?;

        if !org.uses_built_in_domain() {
            self.provisioner.delete_dns_record(token, org).await?;
        }

        // In compatibility mode the organization lives in the shared resource group.
        if !org.single_organization_compatibility_mode {
            self.provisioner
                .delete_resource_group(token, &org.cloud.resource_group)
                .await?;
        }

        Ok(())
    }

    /// Uninstall every selected organization, and with `all` the shared resources too
    pub async fn uninstall_cloud(&self, token: &CancellationToken, all: bool) -> Result<()> {
        if !all {
            let installer = self.clone();
            return self
                .config
                .for_each_org_in_parallel(token, move |token, org| {
                    let installer = installer.clone();
                    async move { installer.uninstall_organization(&token, &org).await }
                })
                .await;
        }

        let provisioner = self.provisioner.clone();
        self.config
            .for_each_org_in_parallel(token, move |token, org| {
                let provisioner = provisioner.clone();
                async move {
                    if org.single_organization_compatibility_mode {
                        return Ok(());
                    }
                    provisioner
                        .delete_resource_group(&token, &org.cloud.resource_group)
                        .await
                }
            })
            .await?;

        for cluster in &self.config.cloud.compute.clusters {
            tracing::info!("Deleting cluster '{}'", cluster.name);
            self.provisioner.delete_cluster(token, cluster).await?;
        }

        let uses_key_vault = self
            .config
            .cloud
            .tls_certificate
            .as_ref()
            .is_some_and(|tls| tls.key_vault.is_some());
        if uses_key_vault {
            self.provisioner.remove_key_vault_access(token).await?;
        }

        self.provisioner
            .delete_resource_group(token, &self.config.cloud.resource_group)
            .await
    }

    async fn preflight(&self, token: &CancellationToken) -> Result<()> {
        let status = self.provisioner.check_auth(token).await?;
        if status.authenticated {
            tracing::debug!(
                provisioner = self.provisioner.name(),
                account = status.account_info.as_deref().unwrap_or_default(),
                "Authenticated"
            );
            return Ok(());
        }

        tracing::error!(
            "Not authenticated with {}: {}",
            self.provisioner.name(),
            status.error.as_deref().unwrap_or("unknown error")
        );
        Err(InstallError::AlreadyLogged)
    }

    async fn ensure_resource_group(&self, token: &CancellationToken, name: &str) -> Result<()> {
        self.provisioner
            .ensure_resource_group(token, name, &self.config.cloud.default_location)
            .await
            .map_err(|err| {
                log_error(&err, "");
                InstallError::AlreadyLogged
            })
    }

    fn managed_identity(
        &self,
        token: &CancellationToken,
        group: &mut PromiseGroup,
        resource_group: &str,
        name: &str,
    ) -> Promise<IdentityHandle> {
        let provisioner = self.provisioner.clone();
        let resource_group = resource_group.to_string();
        let name = name.to_string();
        Promise::new(token, group, move |token| async move {
            provisioner
                .create_managed_identity(&token, &resource_group, &name)
                .await
        })
    }

    /// Trust `identity` from `namespace` on `cluster` once both exist
    fn federate(
        &self,
        token: &CancellationToken,
        group: &mut PromiseGroup,
        identity: &Promise<IdentityHandle>,
        cluster: &Promise<ClusterHandle>,
        namespace: String,
    ) -> Promise<()> {
        let provisioner = self.provisioner.clone();
        let (id, cl) = (identity.clone(), cluster.clone());
        Promise::after(
            token,
            group,
            move |token| async move {
                let identity = id.wait_as_dependency().await?;
                let cluster = cl.wait_as_dependency().await?;
                provisioner
                    .create_federated_identity_credential(&token, &identity, &cluster, &namespace)
                    .await
            },
            vec![identity.as_dependency(), cluster.as_dependency()],
        )
    }

    fn admin_credentials(
        &self,
        token: &CancellationToken,
        group: &mut PromiseGroup,
        cluster: &Promise<ClusterHandle>,
    ) -> Promise<AdminCredentials> {
        let provisioner = self.provisioner.clone();
        let api_host = cluster.clone();
        Promise::after(
            token,
            group,
            move |token| async move {
                let cluster = api_host.wait_as_dependency().await?;
                provisioner.get_admin_credentials(&token, &cluster).await
            },
            vec![cluster.as_dependency()],
        )
    }

    /// Start `action` once the admin credentials resolve
    fn with_credentials<T, F, Fut>(
        &self,
        token: &CancellationToken,
        group: &mut PromiseGroup,
        admin: &Promise<AdminCredentials>,
        action: F,
    ) -> Promise<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(Arc<dyn CloudProvisioner>, CancellationToken, AdminCredentials) -> Fut
            + Send
            + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let provisioner = self.provisioner.clone();
        let credentials = admin.clone();
        Promise::after(
            token,
            group,
            move |token| async move {
                let credentials = credentials.wait_as_dependency().await?;
                action(provisioner, token, credentials).await
            },
            vec![admin.as_dependency()],
        )
    }
}

/// The API-host cluster promise, or a failed stand-in when the graph has none
///
/// Validation requires exactly one API host, so the stand-in only resolves
/// when a caller skipped it. Its steps then short-circuit and the wave
/// reports the violation once.
fn require_api_host(
    token: &CancellationToken,
    group: &mut PromiseGroup,
    cluster: Option<Promise<ClusterHandle>>,
) -> Promise<ClusterHandle> {
    match cluster {
        Some(cluster) => cluster,
        None => Promise::new(token, group, |_| async {
            Err(InstallError::InvariantViolation(
                "no cluster has `apiHost` set".to_string(),
            ))
        }),
    }
}
