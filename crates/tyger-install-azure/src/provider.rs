//! Azure provisioner implementation

use crate::cli::{AzureCli, CommandRunner, ProcessRunner};
use crate::error::{AzureError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tyger_install::config::{
    CloudEnvironmentConfig, ClusterConfig, DatabaseServerConfig, HelmChartConfig,
    OrganizationConfig, StorageAccountConfig, TAG_KEY, TRAEFIK_KEY_VAULT_IDENTITY_NAME,
    TRAEFIK_NAMESPACE,
};
use tyger_install::{
    AdminCredentials, AuthStatus, CloudProvisioner, ClusterHandle, DatabaseServerHandle,
    IdentityHandle, Promise, PromiseGroup, RetryConfig, retry_transient,
};

type StepResult<T> = tyger_install::Result<T>;

const FEDERATED_TOKEN_AUDIENCE: &str = "api://AzureADTokenExchange";
const STORAGE_BLOB_DATA_CONTRIBUTOR: &str = "Storage Blob Data Contributor";
const CSI_SECRETS_STORE_DRIVER: &str = "secrets-store.csi.k8s.io";
const TLS_CERTIFICATE_MOUNT_PATH: &str = "/mnt/tls-certificate";

/// Chart defaults, overridable per chart from `cloud.compute.helm`
struct ChartDefaults {
    release_name: &'static str,
    namespace: &'static str,
    repo_url: &'static str,
    chart_ref: &'static str,
    version: &'static str,
}

const TRAEFIK_CHART: ChartDefaults = ChartDefaults {
    release_name: "traefik",
    namespace: TRAEFIK_NAMESPACE,
    repo_url: "https://traefik.github.io/charts",
    chart_ref: "traefik",
    version: "33.2.1",
};

const CERT_MANAGER_CHART: ChartDefaults = ChartDefaults {
    release_name: "cert-manager",
    namespace: "cert-manager",
    repo_url: "https://charts.jetstack.io",
    chart_ref: "cert-manager",
    version: "v1.16.2",
};

const NVIDIA_DEVICE_PLUGIN_CHART: ChartDefaults = ChartDefaults {
    release_name: "nvdp",
    namespace: "nvidia-device-plugin",
    repo_url: "https://nvidia.github.io/k8s-device-plugin",
    chart_ref: "nvidia-device-plugin",
    version: "0.17.0",
};

/// Provisions Azure resources through the `az`, `kubectl` and `helm` CLIs
pub struct AzureCliProvisioner {
    config: Arc<CloudEnvironmentConfig>,
    cli: AzureCli,
    retry: RetryConfig,
    /// Private directory for admin kubeconfigs, removed on drop
    kubeconfig_dir: TempDir,
}

impl AzureCliProvisioner {
    pub fn new(config: CloudEnvironmentConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(ProcessRunner))
    }

    pub fn with_runner(
        config: CloudEnvironmentConfig,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let cli = AzureCli::new(runner, config.cloud.subscription_id.clone());
        let kubeconfig_dir = tempfile::Builder::new()
            .prefix("tyger-install-")
            .tempdir()?;
        Ok(Self {
            config: Arc::new(config),
            cli,
            retry: RetryConfig::default(),
            kubeconfig_dir,
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn kubeconfig_dir(&self) -> &Path {
        self.kubeconfig_dir.path()
    }

    fn tag(&self) -> String {
        format!("{}={}", TAG_KEY, self.config.environment_name)
    }

    /// Whether a resource carries this environment's tag
    fn belongs_to_environment(&self, tags: Option<&HashMap<String, String>>) -> bool {
        tags.and_then(|tags| tags.get(TAG_KEY))
            .is_some_and(|env| *env == self.config.environment_name)
    }

    fn shared_resource_group(&self) -> &str {
        &self.config.cloud.resource_group
    }

    /// `az` with retries on throttling and conflicting operations
    async fn az_retry(&self, token: &CancellationToken, args: &[&str]) -> Result<String> {
        retry_transient(token, &self.retry, AzureError::is_transient, || {
            self.cli.az(token, args)
        })
        .await
    }

    async fn show_cluster(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<Option<AksCluster>> {
        self.cli
            .az_show(
                token,
                &[
                    "aks",
                    "show",
                    "--resource-group",
                    self.shared_resource_group(),
                    "--name",
                    &cluster.name,
                ],
            )
            .await
    }

    fn cluster_handle(&self, cluster: &ClusterConfig, aks: AksCluster) -> ClusterHandle {
        ClusterHandle {
            name: aks.name,
            resource_group: self.shared_resource_group().to_string(),
            location: aks.location,
            oidc_issuer_url: aks
                .oidc_issuer_profile
                .and_then(|p| p.issuer_url)
                .unwrap_or_default(),
            api_host: cluster.api_host,
        }
    }

    async fn create_cluster_inner(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<ClusterHandle> {
        if let Some(existing) = self.show_cluster(token, cluster).await? {
            tracing::info!("Cluster '{}' already exists", cluster.name);
            return Ok(self.cluster_handle(cluster, existing));
        }

        let system_pool = cluster
            .system_node_pool
            .as_ref()
            .ok_or_else(|| AzureError::NotFound(format!("system node pool of '{}'", cluster.name)))?;
        let min = system_pool.min_count.to_string();
        let max = system_pool.max_count.to_string();
        let tag = self.tag();
        let subnet_id;

        let mut args: Vec<&str> = vec![
            "aks",
            "create",
            "--resource-group",
            self.shared_resource_group(),
            "--name",
            cluster.name.as_str(),
            "--location",
            cluster.location.as_str(),
            "--tier",
            cluster.sku.as_str(),
            "--kubernetes-version",
            cluster.kubernetes_version.as_str(),
            "--nodepool-name",
            system_pool.name.as_str(),
            "--node-vm-size",
            system_pool.vm_size.as_str(),
            "--os-sku",
            system_pool.os_sku.as_str(),
            "--enable-cluster-autoscaler",
            "--min-count",
            min.as_str(),
            "--max-count",
            max.as_str(),
            "--enable-oidc-issuer",
            "--enable-workload-identity",
            "--generate-ssh-keys",
            "--tags",
            tag.as_str(),
        ];
        if let Some(subnet) = &cluster.existing_subnet {
            subnet_id = format!(
                "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
                self.config.cloud.subscription_id,
                subnet.resource_group,
                subnet.vnet_name,
                subnet.subnet_name
            );
            args.extend_from_slice(&["--vnet-subnet-id", &subnet_id]);
        }
        if self.config.cloud.private_networking {
            args.push("--enable-private-cluster");
        }
        if self.key_vault().is_ok() {
            args.extend_from_slice(&["--enable-addons", "azure-keyvault-secrets-provider"]);
        }

        tracing::info!("Creating cluster '{}'", cluster.name);
        let output = self.az_retry(token, &args).await?;
        let aks: AksCluster = serde_json::from_str(&output)?;

        for pool in &cluster.user_node_pools {
            let min = pool.min_count.to_string();
            let max = pool.max_count.to_string();
            tracing::info!("Adding node pool '{}' to cluster '{}'", pool.name, cluster.name);
            self.az_retry(
                token,
                &[
                    "aks",
                    "nodepool",
                    "add",
                    "--resource-group",
                    self.shared_resource_group(),
                    "--cluster-name",
                    &cluster.name,
                    "--name",
                    &pool.name,
                    "--node-vm-size",
                    &pool.vm_size,
                    "--os-sku",
                    &pool.os_sku,
                    "--enable-cluster-autoscaler",
                    "--min-count",
                    &min,
                    "--max-count",
                    &max,
                    "--mode",
                    "User",
                ],
            )
            .await?;
        }

        tracing::info!("Cluster '{}' ready", cluster.name);
        Ok(self.cluster_handle(cluster, aks))
    }

    /// Bind each management principal to `role`, cluster-wide or in `namespace`
    async fn bind_management_principals(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        role: &str,
        namespace: Option<&str>,
    ) -> Result<()> {
        for principal in &self.config.cloud.compute.management_principals {
            let subject = if principal.kind == "Group" {
                "--group"
            } else {
                "--user"
            };
            let binding_name = format!("tyger-management-{}", principal.object_id);
            let clusterrole = format!("--clusterrole={}", role);
            let subject_arg = format!("{}={}", subject, principal.object_id);

            let mut args: Vec<&str> = Vec::new();
            match namespace {
                Some(namespace) => {
                    args.extend_from_slice(&["rolebinding", &binding_name, "--namespace", namespace])
                }
                None => args.extend_from_slice(&["clusterrolebinding", &binding_name]),
            }
            args.extend_from_slice(&[&clusterrole, &subject_arg]);

            self.cli
                .kubectl_create_or_update(token, &credentials.kubeconfig, &args)
                .await?;
        }
        Ok(())
    }

    async fn helm_install(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        defaults: &ChartDefaults,
        overrides: Option<&HelmChartConfig>,
        sets: &[&str],
    ) -> Result<()> {
        let pick = |value: Option<&String>, default: &'static str| -> String {
            value
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| default.to_string())
        };
        let release = pick(overrides.map(|o| &o.release_name), defaults.release_name);
        let namespace = pick(overrides.map(|o| &o.namespace), defaults.namespace);
        let repo_url = pick(overrides.map(|o| &o.repo_url), defaults.repo_url);
        let chart = pick(overrides.map(|o| &o.chart_ref), defaults.chart_ref);
        let version = pick(overrides.map(|o| &o.version), defaults.version);
        let values = match overrides.and_then(|o| o.values.as_ref()) {
            Some(values) => Some(serde_yaml::to_string(values)?),
            None => None,
        };

        let mut args: Vec<&str> = vec![
            "upgrade",
            "--install",
            release.as_str(),
            chart.as_str(),
            "--repo",
            repo_url.as_str(),
            "--version",
            version.as_str(),
            "--namespace",
            namespace.as_str(),
            "--create-namespace",
            "--wait",
        ];
        for set in sets {
            args.extend_from_slice(&["--set", *set]);
        }
        if values.is_some() {
            args.extend_from_slice(&["--values", "-"]);
        }

        tracing::info!("Installing Helm chart '{}' ({})", release, version);
        retry_transient(token, &self.retry, AzureError::is_transient, || {
            self.cli
                .helm(token, &credentials.kubeconfig, &args, values.as_deref())
        })
        .await?;
        Ok(())
    }

    fn key_vault(&self) -> Result<(&str, &str)> {
        self.config
            .cloud
            .tls_certificate
            .as_ref()
            .and_then(|tls| tls.key_vault.as_ref())
            .map(|kv| (kv.resource_group.as_str(), kv.name.as_str()))
            .ok_or_else(|| AzureError::NotFound("cloud.tlsCertificate.keyVault".to_string()))
    }

    fn dns_zone(&self) -> Result<(&str, &str)> {
        self.config
            .cloud
            .dns_zone
            .as_ref()
            .map(|zone| (zone.resource_group.as_str(), zone.name.as_str()))
            .ok_or_else(|| AzureError::NotFound("cloud.dnsZone".to_string()))
    }

    /// Record name of `org`'s domain relative to the DNS zone
    fn dns_record_name<'a>(&self, org: &'a OrganizationConfig, zone: &str) -> Result<&'a str> {
        org.api
            .domain_name
            .strip_suffix(zone)
            .and_then(|name| name.strip_suffix('.'))
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AzureError::UnexpectedOutput(format!(
                    "domain '{}' is not inside zone '{}'",
                    org.api.domain_name, zone
                ))
            })
    }

    async fn traefik_ip(&self, token: &CancellationToken, org: &OrganizationConfig) -> Result<String> {
        let cluster = self
            .config
            .api_host_cluster()
            .ok_or_else(|| AzureError::NotFound("API host cluster".to_string()))?;
        let aks = self
            .show_cluster(token, cluster)
            .await?
            .ok_or_else(|| AzureError::NotFound(format!("cluster '{}'", cluster.name)))?;
        let credentials = self.fetch_admin_credentials(token, &aks.name).await?;

        let output = self
            .cli
            .kubectl(
                token,
                &credentials.kubeconfig,
                &["get", "service", "traefik", "--namespace", TRAEFIK_NAMESPACE, "--output", "json"],
                None,
            )
            .await?;
        let service: KubernetesService = serde_json::from_str(&output)?;
        service
            .status
            .load_balancer
            .ingress
            .into_iter()
            .find_map(|i| i.ip)
            .ok_or_else(|| {
                AzureError::UnexpectedOutput(format!(
                    "Traefik has no public IP yet for organization '{}'",
                    org.name
                ))
            })
    }

    async fn fetch_admin_credentials(
        &self,
        token: &CancellationToken,
        cluster_name: &str,
    ) -> Result<AdminCredentials> {
        let kubeconfig = self.kubeconfig_dir.path().join(format!(
            "tyger-{}-{}.kubeconfig",
            self.config.environment_name, cluster_name
        ));
        let path = kubeconfig.display().to_string();
        self.cli
            .az(
                token,
                &[
                    "aks",
                    "get-credentials",
                    "--resource-group",
                    self.shared_resource_group(),
                    "--name",
                    cluster_name,
                    "--admin",
                    "--overwrite-existing",
                    "--file",
                    &path,
                ],
            )
            .await?;

        Ok(AdminCredentials {
            cluster_name: cluster_name.to_string(),
            kubeconfig,
        })
    }

    /// Delete `resources` by id concurrently, one promise each
    async fn delete_resources(
        &self,
        token: &CancellationToken,
        resources: Vec<GenericResource>,
    ) -> StepResult<()> {
        let mut group = PromiseGroup::new();
        for resource in resources {
            let cli = self.cli.clone();
            let retry = self.retry.clone();
            Promise::new(token, &mut group, move |token| async move {
                tracing::info!("Deleting resource '{}'", resource.id);
                let args = ["resource", "delete", "--ids", resource.id.as_str()];
                retry_transient(&token, &retry, AzureError::is_transient, || {
                    cli.az(&token, &args)
                })
                .await
                .map_err(|e| e.in_step(format!("delete resource '{}'", resource.id)))?;
                tracing::info!("Deleted resource '{}'", resource.id);
                Ok(())
            });
        }
        group.wait().await
    }

    async fn show_identity(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<ManagedIdentity>> {
        self.cli
            .az_show(
                token,
                &["identity", "show", "--resource-group", resource_group, "--name", name],
            )
            .await
    }
}

#[async_trait]
impl CloudProvisioner for AzureCliProvisioner {
    fn name(&self) -> &str {
        "azure-cli"
    }

    async fn check_auth(&self, token: &CancellationToken) -> StepResult<AuthStatus> {
        match self.cli.az_json::<Account>(token, &["account", "show"]).await {
            Ok(account) => Ok(AuthStatus::ok(format!(
                "{} ({})",
                account.user.name, account.name
            ))),
            Err(AzureError::Cancelled) => Err(AzureError::Cancelled.into()),
            Err(err @ AzureError::CliNotFound(_)) => Ok(AuthStatus::failed(err.to_string())),
            Err(err) => Ok(AuthStatus::failed(
                AzureError::AuthenticationFailed(err.to_string()).to_string(),
            )),
        }
    }

    async fn ensure_resource_group(
        &self,
        token: &CancellationToken,
        name: &str,
        location: &str,
    ) -> StepResult<()> {
        let step = format!("create resource group '{}'", name);
        let exists = self
            .cli
            .az(token, &["group", "exists", "--name", name])
            .await
            .map_err(|e| e.in_step(&step))?;
        if exists.trim() == "true" {
            return Ok(());
        }

        tracing::debug!("Creating resource group '{}'", name);
        let tag = self.tag();
        self.az_retry(
            token,
            &["group", "create", "--name", name, "--location", location, "--tags", &tag],
        )
        .await
        .map_err(|e| e.in_step(&step))?;
        Ok(())
    }

    /// The group goes as a whole only when every resource in it is tagged with
    /// this environment; otherwise only the tagged resources are deleted.
    async fn delete_resource_group(&self, token: &CancellationToken, name: &str) -> StepResult<()> {
        let step = format!("delete resource group '{}'", name);
        let resources: Vec<GenericResource> = match self
            .cli
            .az_json(token, &["resource", "list", "--resource-group", name])
            .await
        {
            Ok(resources) => resources,
            Err(err) if err.is_not_found() => {
                tracing::debug!("Resource group '{}' not found", name);
                return Ok(());
            }
            Err(err) => return Err(err.in_step(step)),
        };

        let (ours, foreign): (Vec<_>, Vec<_>) = resources
            .into_iter()
            .partition(|resource| self.belongs_to_environment(resource.tags.as_ref()));

        if foreign.is_empty() {
            tracing::info!("Deleting resource group '{}'", name);
            match self
                .az_retry(token, &["group", "delete", "--name", name, "--yes"])
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_authorization_failed() => tracing::info!(
                    "Insufficient permissions to delete resource group '{}'. Deleting resources individually instead",
                    name
                ),
                Err(err) => return Err(err.in_step(step)),
            }
        } else {
            tracing::info!(
                "Resource group '{}' contains {} resources that are not part of this environment",
                name,
                foreign.len()
            );
        }

        self.delete_resources(token, ours).await
    }

    async fn create_cluster(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> StepResult<ClusterHandle> {
        self.create_cluster_inner(token, cluster)
            .await
            .map_err(|e| e.in_step(format!("create cluster '{}'", cluster.name)))
    }

    async fn get_cluster(
        &self,
        token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> StepResult<ClusterHandle> {
        let step = format!("get cluster '{}'", cluster.name);
        match self.show_cluster(token, cluster).await {
            Ok(Some(aks)) => Ok(self.cluster_handle(cluster, aks)),
            Ok(None) => Err(AzureError::NotFound(format!(
                "cluster '{}'; install the shared resources first",
                cluster.name
            ))
            .in_step(step)),
            Err(err) => Err(err.in_step(step)),
        }
    }

    async fn delete_cluster(&self, token: &CancellationToken, cluster: &ClusterConfig) -> StepResult<()> {
        let result = self
            .az_retry(
                token,
                &[
                    "aks",
                    "delete",
                    "--resource-group",
                    self.shared_resource_group(),
                    "--name",
                    &cluster.name,
                    "--yes",
                ],
            )
            .await;
        match result {
            Err(err) if !err.is_not_found() => {
                Err(err.in_step(format!("delete cluster '{}'", cluster.name)))
            }
            _ => Ok(()),
        }
    }

    async fn get_admin_credentials(
        &self,
        token: &CancellationToken,
        cluster: &ClusterHandle,
    ) -> StepResult<AdminCredentials> {
        self.fetch_admin_credentials(token, &cluster.name)
            .await
            .map_err(|e| e.in_step(format!("get admin credentials for '{}'", cluster.name)))
    }

    async fn create_cluster_rbac(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> StepResult<()> {
        self.bind_management_principals(token, credentials, "cluster-admin", None)
            .await
            .map_err(|e| e.in_step("create cluster RBAC"))
    }

    async fn create_database_server(
        &self,
        token: &CancellationToken,
        database: &DatabaseServerConfig,
    ) -> StepResult<DatabaseServerHandle> {
        let step = format!("create database server '{}'", database.server_name);
        let rg = self.shared_resource_group();
        let server: FlexibleServer = match self
            .cli
            .az_show(
                token,
                &["postgres", "flexible-server", "show", "--resource-group", rg, "--name", &database.server_name],
            )
            .await
            .map_err(|e| e.in_step(&step))?
        {
            Some(server) => server,
            None => {
                let version = database.postgres_major_version.unwrap_or_default().to_string();
                let storage = database.storage_size_gb.unwrap_or_default().to_string();
                let retention = database.backup_retention_days.unwrap_or_default().to_string();
                let geo = if database.backup_geo_redundancy { "Enabled" } else { "Disabled" };
                let tag = self.tag();

                tracing::info!("Creating database server '{}'", database.server_name);
                let output = self
                    .az_retry(
                        token,
                        &[
                            "postgres", "flexible-server", "create",
                            "--resource-group", rg,
                            "--name", &database.server_name,
                            "--location", &database.location,
                            "--tier", &database.compute_tier,
                            "--sku-name", &database.vm_size,
                            "--version", &version,
                            "--storage-size", &storage,
                            "--backup-retention", &retention,
                            "--geo-redundant-backup", geo,
                            "--microsoft-entra-auth", "Enabled",
                            "--password-auth", "Disabled",
                            "--public-access", "None",
                            "--tags", &tag,
                            "--yes",
                        ],
                    )
                    .await
                    .map_err(|e| e.in_step(&step))?;
                serde_json::from_str(&output).map_err(|e| AzureError::from(e).in_step(&step))?
            }
        };

        for rule in &database.firewall_rules {
            self.az_retry(
                token,
                &[
                    "postgres", "flexible-server", "firewall-rule", "create",
                    "--resource-group", rg,
                    "--name", &database.server_name,
                    "--rule-name", &rule.name,
                    "--start-ip-address", &rule.start_ip_address,
                    "--end-ip-address", &rule.end_ip_address,
                ],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        }

        Ok(DatabaseServerHandle {
            name: server.name,
            fqdn: server.fully_qualified_domain_name.unwrap_or_default(),
        })
    }

    async fn create_managed_identity(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        name: &str,
    ) -> StepResult<IdentityHandle> {
        let step = format!("create managed identity '{}'", name);
        let tag = self.tag();
        let output = self
            .az_retry(
                token,
                &["identity", "create", "--resource-group", resource_group, "--name", name, "--tags", &tag],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        let identity: ManagedIdentity =
            serde_json::from_str(&output).map_err(|e| AzureError::from(e).in_step(&step))?;

        Ok(IdentityHandle {
            name: identity.name,
            resource_group: resource_group.to_string(),
            client_id: identity.client_id,
            principal_id: identity.principal_id,
        })
    }

    async fn delete_unused_identities(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        keep: &[String],
    ) -> StepResult<()> {
        let step = format!("delete unused identities in '{}'", resource_group);
        let identities: Vec<ManagedIdentity> = self
            .cli
            .az_json(token, &["identity", "list", "--resource-group", resource_group])
            .await
            .map_err(|e| e.in_step(&step))?;

        for identity in identities {
            if !self.belongs_to_environment(identity.tags.as_ref()) || keep.contains(&identity.name) {
                continue;
            }

            tracing::info!("Deleting unused identity '{}'", identity.name);
            self.az_retry(
                token,
                &["identity", "delete", "--resource-group", resource_group, "--name", &identity.name],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        }
        Ok(())
    }

    async fn create_federated_identity_credential(
        &self,
        token: &CancellationToken,
        identity: &IdentityHandle,
        cluster: &ClusterHandle,
        namespace: &str,
    ) -> StepResult<()> {
        let name = format!("{}-{}", cluster.name, namespace);
        let subject = format!("system:serviceaccount:{}:{}", namespace, identity.name);
        self.az_retry(
            token,
            &[
                "identity", "federated-credential", "create",
                "--resource-group", &identity.resource_group,
                "--identity-name", &identity.name,
                "--name", &name,
                "--issuer", &cluster.oidc_issuer_url,
                "--subject", &subject,
                "--audiences", FEDERATED_TOKEN_AUDIENCE,
            ],
        )
        .await
        .map_err(|e| {
            e.in_step(format!(
                "create federated credential for '{}' on '{}'",
                identity.name, cluster.name
            ))
        })?;
        Ok(())
    }

    async fn grant_key_vault_access(
        &self,
        token: &CancellationToken,
        identity: &IdentityHandle,
    ) -> StepResult<()> {
        let step = "grant key vault access";
        let (resource_group, name) = self.key_vault().map_err(|e| e.in_step(step))?;
        self.az_retry(
            token,
            &[
                "keyvault", "set-policy",
                "--resource-group", resource_group,
                "--name", name,
                "--object-id", &identity.principal_id,
                "--secret-permissions", "get",
                "--certificate-permissions", "get",
            ],
        )
        .await
        .map_err(|e| e.in_step(step))?;
        Ok(())
    }

    async fn remove_key_vault_access(&self, token: &CancellationToken) -> StepResult<()> {
        let step = "remove key vault access";
        let (resource_group, name) = self.key_vault().map_err(|e| e.in_step(step))?;
        let identity = self
            .show_identity(token, self.shared_resource_group(), TRAEFIK_KEY_VAULT_IDENTITY_NAME)
            .await
            .map_err(|e| e.in_step(step))?;
        let Some(identity) = identity else {
            return Ok(());
        };

        self.az_retry(
            token,
            &[
                "keyvault", "delete-policy",
                "--resource-group", resource_group,
                "--name", name,
                "--object-id", &identity.principal_id,
            ],
        )
        .await
        .map_err(|e| e.in_step(step))?;
        Ok(())
    }

    async fn create_namespace(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        name: &str,
    ) -> StepResult<String> {
        self.cli
            .kubectl_create_or_update(token, &credentials.kubeconfig, &["namespace", name])
            .await
            .map_err(|e| e.in_step(format!("create namespace '{}'", name)))?;
        Ok(name.to_string())
    }

    async fn delete_namespace(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        name: &str,
    ) -> StepResult<()> {
        self.cli
            .kubectl(
                token,
                &credentials.kubeconfig,
                &["delete", "namespace", name, "--ignore-not-found", "--wait"],
                None,
            )
            .await
            .map_err(|e| e.in_step(format!("delete namespace '{}'", name)))?;
        Ok(())
    }

    async fn create_namespace_rbac(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        namespace: &str,
    ) -> StepResult<()> {
        self.bind_management_principals(token, credentials, "admin", Some(namespace))
            .await
            .map_err(|e| e.in_step(format!("create RBAC in namespace '{}'", namespace)))
    }

    async fn create_secret_provider_class(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        namespace: &str,
        identity: &IdentityHandle,
        certificate_name: &str,
    ) -> StepResult<()> {
        let step = format!("create SecretProviderClass '{}'", certificate_name);
        let (_, key_vault) = self.key_vault().map_err(|e| e.in_step(&step))?;
        let manifest = serde_json::json!({
            "apiVersion": "secrets-store.csi.x-k8s.io/v1",
            "kind": "SecretProviderClass",
            "metadata": {
                "name": certificate_name,
                "namespace": namespace,
            },
            "spec": {
                "provider": "azure",
                "parameters": {
                    "tenantID": self.config.cloud.tenant_id,
                    "usePodIdentity": "false",
                    "clientID": identity.client_id,
                    "keyvaultName": key_vault,
                    "cloudName": "",
                    "objects": format!(
                        "array:\n  - |\n    objectName: {}\n    objectType: secret\n    objectAlias: tls",
                        certificate_name
                    ),
                },
            },
        });

        self.cli
            .kubectl_apply(token, &credentials.kubeconfig, &manifest.to_string())
            .await
            .map_err(|e| e.in_step(step))
    }

    async fn install_traefik(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
        key_vault_identity: Option<&IdentityHandle>,
    ) -> StepResult<()> {
        let dns_label = format!(
            "service.annotations.service\\.beta\\.kubernetes\\.io/azure-dns-label-name={}",
            self.config.cloud.compute.dns_label
        );
        let client_id;
        let csi_driver;
        let secret_provider_class;
        let mount_path;
        let mut sets = vec![dns_label.as_str()];
        if let Some(identity) = key_vault_identity {
            let certificate_name = self
                .config
                .cloud
                .tls_certificate
                .as_ref()
                .map(|tls| tls.certificate_name.as_str())
                .unwrap_or_default();
            client_id = format!(
                "serviceAccountAnnotations.azure\\.workload\\.identity/client-id={}",
                identity.client_id
            );
            csi_driver = format!(
                "deployment.additionalVolumes[0].csi.driver={}",
                CSI_SECRETS_STORE_DRIVER
            );
            secret_provider_class = format!(
                "deployment.additionalVolumes[0].csi.volumeAttributes.secretProviderClass={}",
                certificate_name
            );
            mount_path = format!("additionalVolumeMounts[0].mountPath={}", TLS_CERTIFICATE_MOUNT_PATH);
            sets.extend_from_slice(&[
                client_id.as_str(),
                "deployment.podLabels.azure\\.workload\\.identity/use=true",
                "deployment.additionalVolumes[0].name=tls-certificate",
                csi_driver.as_str(),
                "deployment.additionalVolumes[0].csi.readOnly=true",
                secret_provider_class.as_str(),
                "additionalVolumeMounts[0].name=tls-certificate",
                mount_path.as_str(),
                "additionalVolumeMounts[0].readOnly=true",
            ]);
        }

        self.helm_install(
            token,
            credentials,
            &TRAEFIK_CHART,
            self.config.cloud.compute.helm.traefik.as_ref(),
            &sets,
        )
        .await
        .map_err(|e| e.in_step("install Traefik"))
    }

    async fn install_cert_manager(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> StepResult<()> {
        self.helm_install(
            token,
            credentials,
            &CERT_MANAGER_CHART,
            self.config.cloud.compute.helm.cert_manager.as_ref(),
            &["crds.enabled=true"],
        )
        .await
        .map_err(|e| e.in_step("install cert-manager"))
    }

    async fn install_nvidia_device_plugin(
        &self,
        token: &CancellationToken,
        credentials: &AdminCredentials,
    ) -> StepResult<()> {
        self.helm_install(
            token,
            credentials,
            &NVIDIA_DEVICE_PLUGIN_CHART,
            self.config.cloud.compute.helm.nvidia_device_plugin.as_ref(),
            &[],
        )
        .await
        .map_err(|e| e.in_step("install NVIDIA device plugin"))
    }

    async fn create_storage_account(
        &self,
        token: &CancellationToken,
        resource_group: &str,
        account: &StorageAccountConfig,
        server_identity: &IdentityHandle,
    ) -> StepResult<()> {
        let step = format!("create storage account '{}'", account.name);
        let tag = self.tag();
        tracing::info!("Creating storage account '{}'", account.name);
        let output = self
            .az_retry(
                token,
                &[
                    "storage", "account", "create",
                    "--resource-group", resource_group,
                    "--name", &account.name,
                    "--location", &account.location,
                    "--sku", &account.sku,
                    "--kind", "StorageV2",
                    "--dns-endpoint-type", &account.dns_endpoint_type,
                    "--allow-shared-key-access", "false",
                    "--min-tls-version", "TLS1_2",
                    "--tags", &tag,
                ],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        let created: StorageAccount =
            serde_json::from_str(&output).map_err(|e| AzureError::from(e).in_step(&step))?;

        self.az_retry(
            token,
            &[
                "role", "assignment", "create",
                "--assignee-object-id", &server_identity.principal_id,
                "--assignee-principal-type", "ServicePrincipal",
                "--role", STORAGE_BLOB_DATA_CONTRIBUTOR,
                "--scope", &created.id,
            ],
        )
        .await
        .map_err(|e| e.in_step(&step))?;
        Ok(())
    }

    /// The migration runner becomes a Microsoft Entra admin of the server; it
    /// creates the database roles for the server identity when it runs.
    async fn create_database(
        &self,
        token: &CancellationToken,
        org: &OrganizationConfig,
        _server_identity: &IdentityHandle,
        migration_identity: &IdentityHandle,
    ) -> StepResult<()> {
        let step = format!("create database '{}'", org.cloud.database_name);
        let rg = self.shared_resource_group();
        let server = &self.config.cloud.database.server_name;

        self.az_retry(
            token,
            &[
                "postgres", "flexible-server", "db", "create",
                "--resource-group", rg,
                "--server-name", server,
                "--database-name", &org.cloud.database_name,
            ],
        )
        .await
        .map_err(|e| e.in_step(&step))?;

        self.az_retry(
            token,
            &[
                "postgres", "flexible-server", "microsoft-entra-admin", "create",
                "--resource-group", rg,
                "--server-name", server,
                "--object-id", &migration_identity.principal_id,
                "--display-name", &format!("{}-{}", org.name, migration_identity.name),
                "--type", "ServicePrincipal",
            ],
        )
        .await
        .map_err(|e| e.in_step(&step))?;
        Ok(())
    }

    async fn delete_database(&self, token: &CancellationToken, org: &OrganizationConfig) -> StepResult<()> {
        let result = self
            .az_retry(
                token,
                &[
                    "postgres", "flexible-server", "db", "delete",
                    "--resource-group", self.shared_resource_group(),
                    "--server-name", &self.config.cloud.database.server_name,
                    "--database-name", &org.cloud.database_name,
                    "--yes",
                ],
            )
            .await;
        match result {
            Err(err) if !err.is_not_found() => {
                Err(err.in_step(format!("delete database '{}'", org.cloud.database_name)))
            }
            _ => Ok(()),
        }
    }

    async fn assign_dns_record(&self, token: &CancellationToken, org: &OrganizationConfig) -> StepResult<()> {
        let step = format!("assign DNS record '{}'", org.api.domain_name);
        let (zone_rg, zone) = self.dns_zone().map_err(|e| e.in_step(&step))?;
        let record = self.dns_record_name(org, zone).map_err(|e| e.in_step(&step))?;
        let ip = self.traefik_ip(token, org).await.map_err(|e| e.in_step(&step))?;

        let existing: Option<ARecordSet> = self
            .cli
            .az_show(
                token,
                &[
                    "network", "dns", "record-set", "a", "show",
                    "--resource-group", zone_rg,
                    "--zone-name", zone,
                    "--name", record,
                ],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        let current: Vec<String> = existing
            .map(|set| set.a_records.into_iter().map(|r| r.ipv4_address).collect())
            .unwrap_or_default();

        if !current.contains(&ip) {
            self.az_retry(
                token,
                &[
                    "network", "dns", "record-set", "a", "add-record",
                    "--resource-group", zone_rg,
                    "--zone-name", zone,
                    "--record-set-name", record,
                    "--ipv4-address", &ip,
                ],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        }

        // The record set ends up holding only the current Traefik address.
        for stale in current.iter().filter(|address| **address != ip) {
            tracing::info!("Removing stale address {} from '{}'", stale, org.api.domain_name);
            self.az_retry(
                token,
                &[
                    "network", "dns", "record-set", "a", "remove-record",
                    "--resource-group", zone_rg,
                    "--zone-name", zone,
                    "--record-set-name", record,
                    "--ipv4-address", stale,
                    "--keep-empty-record-set",
                ],
            )
            .await
            .map_err(|e| e.in_step(&step))?;
        }
        Ok(())
    }

    async fn delete_dns_record(&self, token: &CancellationToken, org: &OrganizationConfig) -> StepResult<()> {
        let step = format!("delete DNS record '{}'", org.api.domain_name);
        let (zone_rg, zone) = self.dns_zone().map_err(|e| e.in_step(&step))?;
        let record = self.dns_record_name(org, zone).map_err(|e| e.in_step(&step))?;

        let result = self
            .az_retry(
                token,
                &[
                    "network", "dns", "record-set", "a", "delete",
                    "--resource-group", zone_rg,
                    "--zone-name", zone,
                    "--name", record,
                    "--yes",
                ],
            )
            .await;
        match result {
            Err(err) if !err.is_not_found() => Err(err.in_step(step)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Account {
    name: String,
    user: AccountUser,
}

#[derive(Debug, Deserialize)]
struct AccountUser {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AksCluster {
    name: String,
    location: String,
    oidc_issuer_profile: Option<OidcIssuerProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OidcIssuerProfile {
    issuer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManagedIdentity {
    name: String,
    client_id: String,
    principal_id: String,
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlexibleServer {
    name: String,
    fully_qualified_domain_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenericResource {
    id: String,
    #[serde(default)]
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ARecordSet {
    #[serde(rename = "ARecords", alias = "aRecords", alias = "arecords", default)]
    a_records: Vec<ARecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ARecord {
    ipv4_address: String,
}

#[derive(Debug, Deserialize)]
struct StorageAccount {
    id: String,
}

#[derive(Debug, Deserialize)]
struct KubernetesService {
    status: ServiceStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStatus {
    load_balancer: LoadBalancerStatus,
}

#[derive(Debug, Default, Deserialize)]
struct LoadBalancerStatus {
    #[serde(default)]
    ingress: Vec<LoadBalancerIngress>,
}

#[derive(Debug, Deserialize)]
struct LoadBalancerIngress {
    ip: Option<String>,
}
