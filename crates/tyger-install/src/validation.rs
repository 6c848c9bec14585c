//! Configuration validation
//!
//! Validation collects every violation instead of stopping at the first, and
//! fills in defaults (locations, versions, per-organization resource groups
//! and namespaces) as it goes.

use crate::config::*;
use crate::error::{InstallError, Result};
use regex::Regex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;

static RESOURCE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z\-0-9]{2,23}$").expect("valid regex"));
static STORAGE_ACCOUNT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]{3,24}$").expect("valid regex"));
static SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?$").expect("valid regex")
});
static DATABASE_SERVER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9\-]{1,61}[a-z0-9])?$").expect("valid regex")
});

const RESERVED_ORGANIZATION_NAMES: &[&str] = &["postgres"];
const CLUSTER_SKUS: &[&str] = &["Free", "Standard", "Premium"];
const OS_SKUS: &[&str] = &["AzureLinux", "Ubuntu"];
const DATABASE_COMPUTE_TIERS: &[&str] = &["Burstable", "GeneralPurpose", "MemoryOptimized"];
const PRINCIPAL_KINDS: &[&str] = &["User", "Group", "ServicePrincipal"];
const TLS_CERTIFICATE_PROVIDERS: &[&str] = &["KeyVault", "LetsEncrypt"];

/// Validate `config` and log every violation
///
/// Returns [`InstallError::AlreadyLogged`] when anything is wrong.
pub fn quick_validate(config: &mut CloudEnvironmentConfig) -> Result<()> {
    match validate(config) {
        Ok(()) => Ok(()),
        Err(violations) => {
            for violation in &violations {
                tracing::error!("{}", violation);
            }
            Err(InstallError::AlreadyLogged)
        }
    }
}

/// Validate `config`, filling in defaults, and return every violation found
pub fn validate(config: &mut CloudEnvironmentConfig) -> std::result::Result<(), Vec<String>> {
    let mut v = Violations::default();

    if config.environment_name.is_empty() {
        v.push("The `environmentName` field is required");
    } else if !RESOURCE_NAME.is_match(&config.environment_name) {
        v.push(format!(
            "The `environmentName` field must match the pattern {}",
            RESOURCE_NAME.as_str()
        ));
    }

    validate_cloud(&mut v, &config.environment_name, &mut config.cloud);
    validate_organizations(&mut v, config);

    v.finish()
}

#[derive(Default)]
struct Violations(Vec<String>);

impl Violations {
    fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    fn finish(self) -> std::result::Result<(), Vec<String>> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self.0)
        }
    }

    /// Empty values take `default`; anything else must be one of `allowed`
    fn optional_enum(&mut self, value: &mut String, default: &str, allowed: &[&str], field: &str) {
        if value.is_empty() {
            *value = default.to_string();
        } else if !allowed.contains(&value.as_str()) {
            let quoted: Vec<String> = allowed.iter().map(|a| format!("`{}`", a)).collect();
            self.push(format!(
                "The `{}` field must be one of [{}]",
                field,
                quoted.join(", ")
            ));
        }
    }
}

fn validate_cloud(v: &mut Violations, environment_name: &str, cloud: &mut CloudConfig) {
    if cloud.subscription_id.is_empty() {
        v.push("The `cloud.subscriptionId` field is required");
    }

    if cloud.default_location.is_empty() {
        v.push("The `cloud.defaultLocation` field is required");
    }

    if cloud.resource_group.is_empty() {
        cloud.resource_group = environment_name.to_string();
    } else if !RESOURCE_NAME.is_match(&cloud.resource_group) {
        v.push(format!(
            "The `cloud.resourceGroup` field must match the pattern {}",
            RESOURCE_NAME.as_str()
        ));
    }

    validate_database(v, &cloud.default_location, &mut cloud.database);
    validate_compute(v, &cloud.default_location, &mut cloud.compute);

    if let Some(tls) = &cloud.tls_certificate {
        match &tls.key_vault {
            None => v.push(
                "If `cloud.tlsCertificate` is specified, `cloud.tlsCertificate.keyVault` must be specified",
            ),
            Some(key_vault) => {
                if key_vault.resource_group.is_empty() {
                    v.push("The `cloud.tlsCertificate.keyVault.resourceGroup` field is required");
                }
                if key_vault.name.is_empty() {
                    v.push("The `cloud.tlsCertificate.keyVault.name` field is required");
                }
            }
        }
        if tls.certificate_name.is_empty() {
            v.push("The `cloud.tlsCertificate.certificateName` field is required");
        }
    }
}

fn validate_compute(v: &mut Violations, default_location: &str, compute: &mut ComputeConfig) {
    if compute.clusters.is_empty() {
        v.push("At least one cluster must be specified");
    }

    let mut api_hosts = 0;
    let mut names = HashSet::new();
    for cluster in &mut compute.clusters {
        if cluster.name.is_empty() {
            v.push("The `name` field is required on a cluster");
        } else if !RESOURCE_NAME.is_match(&cluster.name) {
            v.push(format!(
                "The cluster `name` field must match the pattern {}",
                RESOURCE_NAME.as_str()
            ));
        } else if !names.insert(cluster.name.clone()) {
            v.push("Cluster names must be unique");
        }

        if cluster.location.is_empty() {
            cluster.location = default_location.to_string();
        }
        if cluster.kubernetes_version.is_empty() {
            cluster.kubernetes_version = DEFAULT_KUBERNETES_VERSION.to_string();
        }

        v.optional_enum(
            &mut cluster.sku,
            DEFAULT_CLUSTER_SKU,
            CLUSTER_SKUS,
            &format!("clusters[{}].sku", cluster.name),
        );

        match &mut cluster.system_node_pool {
            Some(pool) => validate_node_pool(v, pool, 1),
            None => v.push(format!(
                "The `systemNodePool` field is required on cluster `{}`",
                cluster.name
            )),
        }
        for pool in &mut cluster.user_node_pools {
            validate_node_pool(v, pool, 0);
        }

        if cluster.api_host {
            api_hosts += 1;
        }
    }

    match api_hosts {
        0 => v.push("One cluster must have `apiHost` set to true"),
        1 => {}
        _ => v.push("Only one cluster can be the API host"),
    }

    if compute.management_principals.is_empty() {
        v.push("At least one management principal is required");
    }
    for principal in &compute.management_principals {
        match principal.kind.as_str() {
            "" => v.push("The `kind` field is required on a management principal"),
            "User" if principal.user_principal_name.is_empty() => {
                v.push("The `userPrincipalName` field is required on a user principal")
            }
            kind if !PRINCIPAL_KINDS.contains(&kind) => v.push(format!(
                "The `kind` field must be one of {:?}",
                PRINCIPAL_KINDS
            )),
            _ => {}
        }
        if principal.object_id.is_empty() {
            v.push("The `objectId` field is required on a management principal");
        } else if !is_guid(&principal.object_id) {
            v.push("The `objectId` field must be a GUID");
        }
    }
}

fn validate_node_pool(v: &mut Violations, pool: &mut NodePoolConfig, min_node_count: i32) {
    if pool.name.is_empty() {
        v.push("The `name` field is required on a node pool");
    } else if !RESOURCE_NAME.is_match(&pool.name) {
        v.push(format!(
            "The node pool `name` field must match the pattern {}",
            RESOURCE_NAME.as_str()
        ));
    }

    if pool.vm_size.is_empty() {
        v.push("The `vmSize` field is required on a node pool");
    }
    if pool.min_count < min_node_count {
        v.push(format!(
            "The `minCount` field must be greater than or equal to {}",
            min_node_count
        ));
    }
    if pool.max_count < 0 {
        v.push("The `maxCount` field must be greater than or equal to 0");
    }
    if pool.min_count > pool.max_count {
        v.push("The `minCount` field must be less than or equal to the `maxCount` field");
    }

    v.optional_enum(
        &mut pool.os_sku,
        DEFAULT_OS_SKU,
        OS_SKUS,
        &format!("nodePools[{}].osSku", pool.name),
    );
}

fn validate_database(v: &mut Violations, default_location: &str, db: &mut DatabaseServerConfig) {
    if db.server_name.is_empty() {
        v.push("The `cloud.database.serverName` field is required");
    } else if !DATABASE_SERVER_NAME.is_match(&db.server_name) {
        v.push(format!(
            "The `cloud.database.serverName` field must match the pattern {}",
            DATABASE_SERVER_NAME.as_str()
        ));
    }

    if db.location.is_empty() {
        db.location = default_location.to_string();
    }
    v.optional_enum(
        &mut db.compute_tier,
        DEFAULT_DATABASE_COMPUTE_TIER,
        DATABASE_COMPUTE_TIERS,
        "cloud.database.computeTier",
    );
    if db.vm_size.is_empty() {
        db.vm_size = DEFAULT_DATABASE_VM_SIZE.to_string();
    }
    db.postgres_major_version
        .get_or_insert(DEFAULT_POSTGRES_MAJOR_VERSION);
    db.storage_size_gb
        .get_or_insert(DEFAULT_DATABASE_STORAGE_SIZE_GB);
    db.backup_retention_days
        .get_or_insert(DEFAULT_BACKUP_RETENTION_DAYS);

    for (i, rule) in db.firewall_rules.iter().enumerate() {
        if rule.name.is_empty() {
            v.push(format!(
                "The `cloud.database.firewallRules[{}].name` field is required",
                i
            ));
            continue;
        }
        if rule.start_ip_address.parse::<IpAddr>().is_err() {
            v.push(format!(
                "Firewall rule '{}' must have a valid IP address as `startIpAddress`",
                rule.name
            ));
        }
        if rule.end_ip_address.parse::<IpAddr>().is_err() {
            v.push(format!(
                "Firewall rule '{}' must have a valid IP address as `endIpAddress`",
                rule.name
            ));
        }
    }
}

fn validate_organizations(v: &mut Violations, config: &mut CloudEnvironmentConfig) {
    let shared_resource_group = config.cloud.resource_group.clone();
    let default_location = config.cloud.default_location.clone();
    let api_host_location = config.api_host_cluster().map(|c| c.location.clone());
    let dns_zone = config.cloud.dns_zone.as_ref().map(|z| z.name.clone());

    let mut names = HashSet::new();
    let mut has_compatibility_mode = false;
    let mut has_built_in_domain = false;

    for org in &mut config.organizations {
        if org.single_organization_compatibility_mode {
            if has_compatibility_mode {
                v.push("Only one organization can have `singleOrganizationCompatibilityMode` set to true");
            }
            has_compatibility_mode = true;
        }

        if org.uses_built_in_domain() {
            if has_built_in_domain {
                v.push("Only one organization can have a built-in domain name");
            } else {
                let label = org.api.domain_name.split('.').next().unwrap_or_default();
                let dns_label = &mut config.cloud.compute.dns_label;
                if !dns_label.is_empty() && dns_label.as_str() != label {
                    v.push(format!(
                        "If `cloud.compute.dnsLabel` is specified, it must be set to '{}' based on the `api.domainName` field of the organization '{}'",
                        label, org.name
                    ));
                } else {
                    *dns_label = label.to_string();
                }
            }
            has_built_in_domain = true;
        }

        if !names.insert(org.name.to_ascii_lowercase()) {
            v.push("Organization names must be unique");
        }

        validate_organization(
            v,
            &shared_resource_group,
            &default_location,
            api_host_location.as_deref(),
            dns_zone.as_deref(),
            org,
        );
    }
}

fn validate_organization(
    v: &mut Violations,
    shared_resource_group: &str,
    default_location: &str,
    api_host_location: Option<&str>,
    dns_zone: Option<&str>,
    org: &mut OrganizationConfig,
) {
    if org.name.is_empty() {
        v.push("The `organization.name` field is required");
    } else if !SUBDOMAIN.is_match(&org.name) {
        v.push(format!(
            "The `organization.name` field must match the pattern {}",
            SUBDOMAIN.as_str()
        ));
    } else if RESERVED_ORGANIZATION_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(&org.name))
    {
        v.push(format!(
            "The `organization.name` field cannot be {}",
            org.name
        ));
    }

    let cloud = &mut org.cloud;
    if org.single_organization_compatibility_mode {
        if cloud.database_name.is_empty() {
            cloud.database_name = DEFAULT_COMPATIBILITY_DATABASE_NAME.to_string();
        }
        cloud.resource_group = shared_resource_group.to_string();
        cloud.kubernetes_namespace = "tyger".to_string();
    } else {
        if cloud.database_name.is_empty() {
            cloud.database_name = org.name.clone();
        }
        cloud.resource_group = format!("{}-{}", shared_resource_group, org.name);
        cloud.kubernetes_namespace = org.name.clone();
    }

    for identity in &cloud.identities {
        if identity.is_empty() {
            v.push(format!(
                "The `identities` field must not contain empty strings for organization '{}'",
                org.name
            ));
        } else if is_system_identity_name(identity) {
            v.push(format!(
                "The `identities` field must not contain the reserved name '{}' for organization '{}'",
                identity, org.name
            ));
        }
    }

    match &mut cloud.storage.logs {
        Some(logs) => {
            validate_storage_account(v, &org.name, default_location, "cloud.storage.logs", logs)
        }
        None => v.push(format!(
            "The `cloud.storage.logs` field is required for organization '{}'",
            org.name
        )),
    }
    if cloud.storage.buffers.is_empty() {
        v.push(format!(
            "At least one `cloud.storage.buffers` account must be specified for organization '{}'",
            org.name
        ));
    }
    for (i, buffer) in cloud.storage.buffers.iter_mut().enumerate() {
        let path = format!("cloud.storage.buffers[{}]", i);
        validate_storage_account(v, &org.name, default_location, &path, buffer);
    }

    validate_api(v, api_host_location, dns_zone, org);
}

fn validate_storage_account(
    v: &mut Violations,
    org_name: &str,
    default_location: &str,
    path: &str,
    account: &mut StorageAccountConfig,
) {
    if account.name.is_empty() {
        v.push(format!(
            "The `{}.name` field is required for organization '{}'",
            path, org_name
        ));
    } else if !STORAGE_ACCOUNT_NAME.is_match(&account.name) {
        v.push(format!(
            "The `{}.name` field must match the pattern {} for organization '{}'",
            path,
            STORAGE_ACCOUNT_NAME.as_str(),
            org_name
        ));
    }

    if account.location.is_empty() {
        account.location = default_location.to_string();
    }
    if account.sku.is_empty() {
        account.sku = DEFAULT_STORAGE_SKU.to_string();
    }
    if account.dns_endpoint_type.is_empty() {
        account.dns_endpoint_type = DEFAULT_DNS_ENDPOINT_TYPE.to_string();
    }
}

fn validate_api(
    v: &mut Violations,
    api_host_location: Option<&str>,
    dns_zone: Option<&str>,
    org: &mut OrganizationConfig,
) {
    let domain = &org.api.domain_name;
    if domain.is_empty() {
        v.push(format!(
            "The `api.domainName` field is required for organization '{}'",
            org.name
        ));
    } else if org.uses_built_in_domain() {
        if let Some(location) = api_host_location.filter(|l| !l.is_empty()) {
            let suffix = format!(".{}{}", location, BUILT_IN_DOMAIN_NAME_SUFFIX);
            let label_ok = domain
                .strip_suffix(&suffix)
                .is_some_and(|label| SUBDOMAIN.is_match(label));
            if !label_ok {
                v.push(format!(
                    "The `api.domainName` field must be of the form <label>{} or use a custom domain for organization '{}'",
                    suffix, org.name
                ));
            }
        }
    } else {
        match dns_zone.filter(|z| !z.is_empty()) {
            None => v.push(format!(
                "The `cloud.dnsZone.name` field is required for the custom domain name for organization '{}'",
                org.name
            )),
            Some(zone) if !domain.ends_with(&format!(".{}", zone)) => v.push(format!(
                "The `api.domainName` field must be a subdomain of DNS zone name '{}' defined in `cloud.dnsZone` for organization '{}'",
                zone, org.name
            )),
            Some(_) => {}
        }
    }

    if org.api.tls_certificate_provider.is_empty() {
        org.api.tls_certificate_provider = "LetsEncrypt".to_string();
    } else if !TLS_CERTIFICATE_PROVIDERS.contains(&org.api.tls_certificate_provider.as_str()) {
        v.push(format!(
            "The `api.tlsCertificateProvider` field must be one of {:?} for organization '{}'",
            TLS_CERTIFICATE_PROVIDERS, org.name
        ));
    }
}

fn is_system_identity_name(name: &str) -> bool {
    [
        TYGER_SERVER_IDENTITY_NAME,
        MIGRATION_RUNNER_IDENTITY_NAME,
        TRAEFIK_KEY_VAULT_IDENTITY_NAME,
    ]
    .iter()
    .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

fn is_guid(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
kind: azureCloud
environmentName: demo
cloud:
  subscriptionId: 00000000-0000-0000-0000-000000000000
  defaultLocation: westus2
  compute:
    clusters:
      - name: demo
        apiHost: true
        systemNodePool:
          name: system
          vmSize: Standard_DS2_v2
          minCount: 1
          maxCount: 3
        userNodePools:
          - name: cpunp
            vmSize: Standard_DS12_v2
            minCount: 0
            maxCount: 10
    managementPrincipals:
      - kind: User
        objectId: 11111111-2222-3333-4444-555555555555
        userPrincipalName: me@example.com
  database:
    serverName: demo-db
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

    fn valid_config() -> CloudEnvironmentConfig {
        CloudEnvironmentConfig::from_yaml(VALID).unwrap()
    }

    #[test]
    fn test_valid_config_gets_defaults() {
        let mut config = valid_config();
        validate(&mut config).unwrap();

        assert_eq!(config.cloud.resource_group, "demo");
        let cluster = &config.cloud.compute.clusters[0];
        assert_eq!(cluster.location, "westus2");
        assert_eq!(cluster.kubernetes_version, DEFAULT_KUBERNETES_VERSION);
        assert_eq!(cluster.sku, "Standard");
        assert_eq!(config.cloud.database.compute_tier, "Burstable");
        assert_eq!(config.cloud.database.vm_size, "Standard_B1ms");
        assert_eq!(config.cloud.database.postgres_major_version, Some(16));
        assert_eq!(config.cloud.database.storage_size_gb, Some(32));
        assert_eq!(config.cloud.database.backup_retention_days, Some(7));
        assert_eq!(config.cloud.compute.dns_label, "lamna-tyger");

        let org = &config.organizations[0].cloud;
        assert_eq!(org.resource_group, "demo-lamna");
        assert_eq!(org.kubernetes_namespace, "lamna");
        assert_eq!(org.database_name, "lamna");
        assert_eq!(org.storage.logs.as_ref().unwrap().location, "westus2");
        assert_eq!(org.storage.buffers[0].sku, "Standard_LRS");
    }

    #[test]
    fn test_compatibility_mode_uses_shared_names() {
        let mut config = valid_config();
        config.organizations[0].single_organization_compatibility_mode = true;
        validate(&mut config).unwrap();

        let org = &config.organizations[0].cloud;
        assert_eq!(org.resource_group, "demo");
        assert_eq!(org.kubernetes_namespace, "tyger");
        assert_eq!(org.database_name, "postgres");
    }

    #[test]
    fn test_collects_every_violation() {
        let mut config = valid_config();
        config.environment_name = "Demo!".to_string();
        config.cloud.subscription_id.clear();
        config.cloud.compute.clusters[0].api_host = false;
        config.organizations[0].cloud.storage.buffers.clear();

        let violations = validate(&mut config).unwrap_err();
        assert_eq!(violations.len(), 4, "{:?}", violations);
        assert!(violations[0].contains("environmentName"));
        assert!(violations.iter().any(|v| v.contains("apiHost")));
        assert!(violations.iter().any(|v| v.contains("buffers")));
    }

    #[test]
    fn test_reserved_and_duplicate_org_names() {
        let mut config = valid_config();
        let mut second = config.organizations[0].clone();
        second.api.domain_name = "api.contoso.com".to_string();
        config.cloud.dns_zone = Some(NamedAzureResource {
            resource_group: "dns".to_string(),
            name: "contoso.com".to_string(),
        });
        config.organizations.push(second);

        let mut reserved = config.organizations[1].clone();
        reserved.name = "Postgres".to_string();
        config.organizations.push(reserved);

        let violations = validate(&mut config).unwrap_err();
        assert!(violations.contains(&"Organization names must be unique".to_string()));
        assert!(violations.iter().any(|v| v.contains("cannot be Postgres")));
    }

    #[test]
    fn test_custom_domain_requires_dns_zone() {
        let mut config = valid_config();
        config.organizations[0].api.domain_name = "api.contoso.com".to_string();

        let violations = validate(&mut config).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("cloud.dnsZone.name"));
    }

    #[test]
    fn test_built_in_domain_must_match_api_host_location() {
        let mut config = valid_config();
        config.organizations[0].api.domain_name = "lamna.eastus.cloudapp.azure.com".to_string();

        let violations = validate(&mut config).unwrap_err();
        assert!(violations[0].contains(".westus2.cloudapp.azure.com"));
    }

    #[test]
    fn test_invalid_storage_and_node_pool() {
        let mut config = valid_config();
        config.organizations[0].cloud.storage.buffers[0].name = "Bad_Name".to_string();
        let pool = config.cloud.compute.clusters[0]
            .system_node_pool
            .as_mut()
            .unwrap();
        pool.min_count = 5;
        pool.max_count = 2;

        let violations = validate(&mut config).unwrap_err();
        assert!(violations.iter().any(|v| v.contains("buffers[0].name")));
        assert!(violations.iter().any(|v| v.contains("less than or equal")));
    }

    #[test]
    fn test_reserved_identity_names() {
        let mut config = valid_config();
        config.organizations[0].cloud.identities = vec!["tyger-server".to_string()];

        let violations = validate(&mut config).unwrap_err();
        assert!(violations[0].contains("reserved name 'tyger-server'"));
    }

    #[test]
    fn test_quick_validate_returns_already_logged() {
        let mut config = valid_config();
        config.cloud.compute.management_principals.clear();
        assert!(matches!(
            quick_validate(&mut config),
            Err(InstallError::AlreadyLogged)
        ));
    }

    #[test]
    fn test_guid_shape() {
        assert!(is_guid("11111111-2222-3333-4444-555555555555"));
        assert!(!is_guid("not-a-guid"));
    }
}
