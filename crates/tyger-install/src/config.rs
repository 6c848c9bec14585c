//! Cloud environment configuration
//!
//! Parsed from the YAML file handed to `tyger-install`. Fields derived during
//! validation (organization resource groups, namespaces, defaults) are filled
//! in by [`crate::validation::validate`].

use crate::error::{ConfigError, Result};
use crate::group::PromiseGroup;
use crate::promise::Promise;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub const CONFIG_KIND_CLOUD: &str = "azureCloud";
pub const BUILT_IN_DOMAIN_NAME_SUFFIX: &str = ".cloudapp.azure.com";
pub const TAG_KEY: &str = "tyger-environment";

pub const TRAEFIK_NAMESPACE: &str = "traefik";
pub const TYGER_SERVER_IDENTITY_NAME: &str = "tyger-server";
pub const MIGRATION_RUNNER_IDENTITY_NAME: &str = "tyger-migration-runner";
pub const TRAEFIK_KEY_VAULT_IDENTITY_NAME: &str = "traefik-key-vault-client";

pub const DEFAULT_KUBERNETES_VERSION: &str = "1.30";
pub const DEFAULT_DATABASE_COMPUTE_TIER: &str = "Burstable";
pub const DEFAULT_DATABASE_VM_SIZE: &str = "Standard_B1ms";
pub const DEFAULT_POSTGRES_MAJOR_VERSION: u32 = 16;
pub const DEFAULT_DATABASE_STORAGE_SIZE_GB: u32 = 32;
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_COMPATIBILITY_DATABASE_NAME: &str = "postgres";
pub const DEFAULT_CLUSTER_SKU: &str = "Standard";
pub const DEFAULT_OS_SKU: &str = "AzureLinux";
pub const DEFAULT_STORAGE_SKU: &str = "Standard_LRS";
pub const DEFAULT_DNS_ENDPOINT_TYPE: &str = "Standard";

/// Root of the configuration file (`kind: azureCloud`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudEnvironmentConfig {
    pub kind: String,
    pub environment_name: String,
    pub cloud: CloudConfig,
    pub organizations: Vec<OrganizationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    pub tenant_id: String,
    pub subscription_id: String,
    pub default_location: String,
    pub resource_group: String,
    pub private_networking: bool,
    pub compute: ComputeConfig,
    pub database: DatabaseServerConfig,
    pub dns_zone: Option<NamedAzureResource>,
    pub tls_certificate: Option<TlsCertificate>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComputeConfig {
    pub clusters: Vec<ClusterConfig>,
    pub management_principals: Vec<Principal>,
    pub dns_label: String,
    pub helm: SharedHelmConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub name: String,
    pub api_host: bool,
    pub location: String,
    pub sku: String,
    pub kubernetes_version: String,
    pub system_node_pool: Option<NodePoolConfig>,
    pub user_node_pools: Vec<NodePoolConfig>,
    pub existing_subnet: Option<ExistingSubnetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExistingSubnetConfig {
    pub resource_group: String,
    pub vnet_name: String,
    pub subnet_name: String,
    pub private_link_resource_group: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodePoolConfig {
    pub name: String,
    pub vm_size: String,
    pub os_sku: String,
    pub min_count: i32,
    pub max_count: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Principal {
    pub kind: String,
    pub object_id: String,
    pub user_principal_name: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseServerConfig {
    pub server_name: String,
    pub location: String,
    pub compute_tier: String,
    pub vm_size: String,
    pub firewall_rules: Vec<FirewallRule>,
    pub postgres_major_version: Option<u32>,
    #[serde(rename = "storageSizeGB")]
    pub storage_size_gb: Option<u32>,
    pub backup_retention_days: Option<u32>,
    pub backup_geo_redundancy: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirewallRule {
    pub name: String,
    pub start_ip_address: String,
    pub end_ip_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamedAzureResource {
    pub resource_group: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsCertificate {
    pub key_vault: Option<NamedAzureResource>,
    pub certificate_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedHelmConfig {
    pub traefik: Option<HelmChartConfig>,
    pub cert_manager: Option<HelmChartConfig>,
    pub nvidia_device_plugin: Option<HelmChartConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmChartConfig {
    pub namespace: String,
    pub release_name: String,
    pub repo_name: String,
    pub repo_url: String,
    pub version: String,
    pub chart_ref: String,
    pub values: Option<serde_yaml::Value>,
}

/// A tenant sharing the environment's clusters and database server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationConfig {
    pub name: String,
    pub single_organization_compatibility_mode: bool,
    pub cloud: OrganizationCloudConfig,
    pub api: OrganizationApiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationCloudConfig {
    /// Derived during validation
    #[serde(skip)]
    pub resource_group: String,
    pub database_name: String,
    /// Derived during validation
    #[serde(skip)]
    pub kubernetes_namespace: String,
    pub storage: OrganizationStorageConfig,
    pub identities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationStorageConfig {
    pub buffers: Vec<StorageAccountConfig>,
    pub logs: Option<StorageAccountConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageAccountConfig {
    pub name: String,
    pub location: String,
    pub sku: String,
    pub dns_endpoint_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrganizationApiConfig {
    pub domain_name: String,
    pub tls_certificate_provider: String,
}

impl OrganizationConfig {
    pub fn uses_built_in_domain(&self) -> bool {
        self.api.domain_name.ends_with(BUILT_IN_DOMAIN_NAME_SUFFIX)
    }
}

impl CloudEnvironmentConfig {
    /// Read and parse a configuration file
    pub fn load(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> std::result::Result<Self, ConfigError> {
        let config: CloudEnvironmentConfig = serde_yaml::from_str(content)?;
        match config.kind.as_str() {
            "" => Err(ConfigError::MissingKind),
            CONFIG_KIND_CLOUD => Ok(config),
            other => Err(ConfigError::UnsupportedKind(other.to_string())),
        }
    }

    pub fn api_host_cluster(&self) -> Option<&ClusterConfig> {
        self.cloud.compute.clusters.iter().find(|c| c.api_host)
    }

    /// Narrow the configuration to the one organization a command applies to
    pub fn apply_single_org_filter(
        &mut self,
        specified: Option<&str>,
    ) -> std::result::Result<(), ConfigError> {
        let Some(specified) = specified.filter(|s| !s.is_empty()) else {
            return match self.organizations.len() {
                0 => Err(ConfigError::Organization(
                    "no organizations found in configuration".to_string(),
                )),
                1 => Ok(()),
                _ => Err(ConfigError::Organization(
                    "since the configuration contains multiple organizations, and this command can only apply to a single organization, please specify an organization using the --org flag".to_string(),
                )),
            };
        };

        match self
            .organizations
            .iter()
            .position(|org| org.name.eq_ignore_ascii_case(specified))
        {
            Some(index) => {
                let org = self.organizations.swap_remove(index);
                self.organizations = vec![org];
                Ok(())
            }
            None => Err(ConfigError::Organization(format!(
                "organization '{}' not found in configuration",
                specified
            ))),
        }
    }

    /// Narrow the configuration to the named organizations
    ///
    /// An empty (or all-blank) list keeps every organization. Names match
    /// case-insensitively and duplicates collapse.
    pub fn apply_multi_org_filter(
        &mut self,
        specified: &[String],
    ) -> std::result::Result<(), ConfigError> {
        let requested: Vec<&str> = specified
            .iter()
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .collect();
        if requested.is_empty() {
            return Ok(());
        }

        let mut selected: Vec<OrganizationConfig> = Vec::new();
        for name in requested {
            let org = self
                .organizations
                .iter()
                .find(|org| org.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    ConfigError::Organization(format!(
                        "organization '{}' not found in configuration",
                        name
                    ))
                })?;

            if !selected.iter().any(|s| s.name == org.name) {
                selected.push(org.clone());
            }
        }

        self.organizations = selected;
        Ok(())
    }

    /// Run `action` once per organization, concurrently
    ///
    /// Every organization's action runs to completion. The first error that is
    /// not a short-circuit is returned, unlogged.
    pub async fn for_each_org_in_parallel<F, Fut>(
        &self,
        token: &CancellationToken,
        action: F,
    ) -> Result<()>
    where
        F: Fn(CancellationToken, OrganizationConfig) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut group = PromiseGroup::new();
        for org in &self.organizations {
            let span = tracing::info_span!("org", organization = %org.name);
            let org = org.clone();
            let action = action.clone();
            span.in_scope(|| {
                Promise::new(token, &mut group, move |token| action(token, org));
            });
        }

        group.first_error().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InstallError;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn org(name: &str) -> OrganizationConfig {
        OrganizationConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn config_with_orgs(names: &[&str]) -> CloudEnvironmentConfig {
        CloudEnvironmentConfig {
            kind: CONFIG_KIND_CLOUD.to_string(),
            environment_name: "demo".to_string(),
            organizations: names.iter().map(|n| org(n)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_minimal_yaml() {
        let yaml = r#"
kind: azureCloud
environmentName: demo
cloud:
  subscriptionId: 00000000-0000-0000-0000-000000000000
  defaultLocation: westus2
  privateNetworking: true
  compute:
    clusters:
      - name: demo
        apiHost: true
        systemNodePool:
          name: system
          vmSize: Standard_DS2_v2
          minCount: 1
          maxCount: 3
  database:
    serverName: demo-db
    storageSizeGB: 64
organizations:
  - name: lamna
    cloud:
      storage:
        logs:
          name: lamnalogs
        buffers:
          - name: lamnabuf1
    api:
      domainName: lamna-tyger.westus2.cloudapp.azure.com
"#;
        let config = CloudEnvironmentConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.environment_name, "demo");
        assert!(config.cloud.private_networking);
        assert_eq!(config.cloud.database.storage_size_gb, Some(64));
        assert_eq!(config.api_host_cluster().unwrap().name, "demo");
        assert_eq!(config.organizations.len(), 1);
        assert_eq!(config.organizations[0].cloud.storage.buffers.len(), 1);
        assert!(config.organizations[0].uses_built_in_domain());
    }

    #[test]
    fn test_missing_kind_is_rejected() {
        let err = CloudEnvironmentConfig::from_yaml("environmentName: demo\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKind));
    }

    #[test]
    fn test_unsupported_kind_is_rejected() {
        let err = CloudEnvironmentConfig::from_yaml("kind: docker\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedKind(kind) if kind == "docker"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "kind: azureCloud\nenvironmentName: fromfile").unwrap();

        let config = CloudEnvironmentConfig::load(file.path()).unwrap();
        assert_eq!(config.environment_name, "fromfile");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CloudEnvironmentConfig::load(dir.path().join("nope.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_single_org_filter() {
        let mut config = config_with_orgs(&["lamna"]);
        assert!(config.apply_single_org_filter(None).is_ok());

        let mut config = config_with_orgs(&["lamna", "contoso"]);
        let err = config.apply_single_org_filter(None).unwrap_err();
        assert!(err.to_string().contains("--org"));

        config.apply_single_org_filter(Some("CONTOSO")).unwrap();
        assert_eq!(config.organizations.len(), 1);
        assert_eq!(config.organizations[0].name, "contoso");

        let mut config = config_with_orgs(&[]);
        assert!(config.apply_single_org_filter(None).is_err());

        let mut config = config_with_orgs(&["lamna"]);
        let err = config.apply_single_org_filter(Some("fabrikam")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "organization 'fabrikam' not found in configuration"
        );
    }

    #[test]
    fn test_multi_org_filter() {
        let mut config = config_with_orgs(&["lamna", "contoso", "fabrikam"]);
        config
            .apply_multi_org_filter(&["".to_string()])
            .unwrap();
        assert_eq!(config.organizations.len(), 3);

        config
            .apply_multi_org_filter(&[
                "Fabrikam".to_string(),
                "lamna".to_string(),
                "fabrikam".to_string(),
            ])
            .unwrap();
        let names: Vec<&str> = config.organizations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["fabrikam", "lamna"]);

        let err = config
            .apply_multi_org_filter(&["contoso".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("contoso"));
    }

    #[tokio::test]
    async fn test_for_each_org_in_parallel_visits_every_org() {
        let config = config_with_orgs(&["lamna", "contoso", "fabrikam"]);
        let visited = Arc::new(Mutex::new(Vec::new()));

        let seen = visited.clone();
        let result = config
            .for_each_org_in_parallel(&CancellationToken::new(), move |_, org| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(org.name.clone());
                    if org.name == "contoso" {
                        Err(InstallError::provision("delete namespace", "forbidden"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap_err().to_string(), "delete namespace: forbidden");
        let mut visited = visited.lock().unwrap().clone();
        visited.sort();
        assert_eq!(visited, vec!["contoso", "fabrikam", "lamna"]);
    }
}
