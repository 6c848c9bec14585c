use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tyger_install::config::{
    ClusterConfig, DatabaseServerConfig, OrganizationConfig, StorageAccountConfig,
};
use tyger_install::{
    AdminCredentials, AuthStatus, CloudEnvironmentConfig, CloudProvisioner, ClusterHandle,
    DatabaseServerHandle, IdentityHandle, InstallError, Result,
};

pub const TWO_ORGS: &str = r#"
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
      - name: demo-gpu
        location: eastus
        systemNodePool:
          name: system
          vmSize: Standard_DS2_v2
          minCount: 1
          maxCount: 3
    managementPrincipals:
      - kind: Group
        objectId: 11111111-2222-3333-4444-555555555555
  database:
    serverName: demo-db
  dnsZone:
    resourceGroup: dns
    name: contoso.com
organizations:
  - name: lamna
    cloud:
      identities: [batch]
      storage:
        logs:
          name: lamnalogs
        buffers:
          - name: lamnabuf1
          - name: lamnabuf2
    api:
      domainName: lamna-tyger.westus2.cloudapp.azure.com
  - name: contoso
    cloud:
      storage:
        logs:
          name: contosologs
        buffers:
          - name: contosobuf1
    api:
      domainName: tyger.contoso.com
"#;

/// A validated two-organization environment
pub fn two_org_config() -> CloudEnvironmentConfig {
    let mut config = CloudEnvironmentConfig::from_yaml(TWO_ORGS).unwrap();
    tyger_install::validate(&mut config).unwrap();
    config
}

/// Provisioner that records every call and fails the ones it is told to
pub struct RecordingProvisioner {
    calls: Mutex<Vec<String>>,
    failures: HashMap<String, String>,
    authenticated: bool,
}

#[allow(dead_code)]
impl RecordingProvisioner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: HashMap::new(),
            authenticated: true,
        }
    }

    pub fn failing(mut self, call: &str, message: &str) -> Self {
        self.failures.insert(call.to_string(), message.to_string());
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Position of `call` in the recorded order
    pub fn position(&self, call: &str) -> usize {
        self.calls()
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{} was not called", call))
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call.clone());
        match self.failures.get(&call) {
            Some(message) => Err(InstallError::provision(call, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CloudProvisioner for RecordingProvisioner {
    fn name(&self) -> &str {
        "recording"
    }

    async fn check_auth(&self, _token: &CancellationToken) -> Result<AuthStatus> {
        if self.authenticated {
            Ok(AuthStatus::ok("tester@example.com"))
        } else {
            Ok(AuthStatus::failed("please run 'az login'"))
        }
    }

    async fn ensure_resource_group(
        &self,
        _token: &CancellationToken,
        name: &str,
        _location: &str,
    ) -> Result<()> {
        self.record(format!("ensure_resource_group:{}", name))
    }

    async fn delete_resource_group(&self, _token: &CancellationToken, name: &str) -> Result<()> {
        self.record(format!("delete_resource_group:{}", name))
    }

    async fn create_cluster(
        &self,
        _token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<ClusterHandle> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.record(format!("create_cluster:{}", cluster.name))?;
        Ok(handle(cluster))
    }

    async fn get_cluster(
        &self,
        _token: &CancellationToken,
        cluster: &ClusterConfig,
    ) -> Result<ClusterHandle> {
        self.record(format!("get_cluster:{}", cluster.name))?;
        Ok(handle(cluster))
    }

    async fn delete_cluster(&self, _token: &CancellationToken, cluster: &ClusterConfig) -> Result<()> {
        self.record(format!("delete_cluster:{}", cluster.name))
    }

    async fn get_admin_credentials(
        &self,
        _token: &CancellationToken,
        cluster: &ClusterHandle,
    ) -> Result<AdminCredentials> {
        self.record(format!("get_admin_credentials:{}", cluster.name))?;
        Ok(AdminCredentials {
            cluster_name: cluster.name.clone(),
            kubeconfig: PathBuf::from("/tmp/kubeconfig"),
        })
    }

    async fn create_cluster_rbac(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
    ) -> Result<()> {
        self.record("create_cluster_rbac".to_string())
    }

    async fn create_database_server(
        &self,
        _token: &CancellationToken,
        database: &DatabaseServerConfig,
    ) -> Result<DatabaseServerHandle> {
        self.record(format!("create_database_server:{}", database.server_name))?;
        Ok(DatabaseServerHandle {
            name: database.server_name.clone(),
            fqdn: format!("{}.postgres.database.azure.com", database.server_name),
        })
    }

    async fn create_managed_identity(
        &self,
        _token: &CancellationToken,
        resource_group: &str,
        name: &str,
    ) -> Result<IdentityHandle> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.record(format!("create_managed_identity:{}/{}", resource_group, name))?;
        Ok(IdentityHandle {
            name: name.to_string(),
            resource_group: resource_group.to_string(),
            client_id: format!("client-{}", name),
            principal_id: format!("principal-{}", name),
        })
    }

    async fn delete_unused_identities(
        &self,
        _token: &CancellationToken,
        resource_group: &str,
        _keep: &[String],
    ) -> Result<()> {
        self.record(format!("delete_unused_identities:{}", resource_group))
    }

    async fn create_federated_identity_credential(
        &self,
        _token: &CancellationToken,
        identity: &IdentityHandle,
        cluster: &ClusterHandle,
        namespace: &str,
    ) -> Result<()> {
        self.record(format!(
            "federate:{}:{}@{}",
            identity.name, namespace, cluster.name
        ))
    }

    async fn grant_key_vault_access(
        &self,
        _token: &CancellationToken,
        identity: &IdentityHandle,
    ) -> Result<()> {
        self.record(format!("grant_key_vault_access:{}", identity.name))
    }

    async fn remove_key_vault_access(&self, _token: &CancellationToken) -> Result<()> {
        self.record("remove_key_vault_access".to_string())
    }

    async fn create_namespace(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
        name: &str,
    ) -> Result<String> {
        self.record(format!("create_namespace:{}", name))?;
        Ok(name.to_string())
    }

    async fn delete_namespace(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
        name: &str,
    ) -> Result<()> {
        self.record(format!("delete_namespace:{}", name))
    }

    async fn create_namespace_rbac(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
        namespace: &str,
    ) -> Result<()> {
        self.record(format!("create_namespace_rbac:{}", namespace))
    }

    async fn create_secret_provider_class(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
        namespace: &str,
        identity: &IdentityHandle,
        certificate_name: &str,
    ) -> Result<()> {
        self.record(format!(
            "create_secret_provider_class:{}:{}:{}",
            namespace, identity.name, certificate_name
        ))
    }

    async fn install_traefik(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
        key_vault_identity: Option<&IdentityHandle>,
    ) -> Result<()> {
        match key_vault_identity {
            Some(identity) => self.record(format!("install_traefik:{}", identity.name)),
            None => self.record("install_traefik".to_string()),
        }
    }

    async fn install_cert_manager(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
    ) -> Result<()> {
        self.record("install_cert_manager".to_string())
    }

    async fn install_nvidia_device_plugin(
        &self,
        _token: &CancellationToken,
        _credentials: &AdminCredentials,
    ) -> Result<()> {
        self.record("install_nvidia_device_plugin".to_string())
    }

    async fn create_storage_account(
        &self,
        _token: &CancellationToken,
        _resource_group: &str,
        account: &StorageAccountConfig,
        _server_identity: &IdentityHandle,
    ) -> Result<()> {
        self.record(format!("create_storage_account:{}", account.name))
    }

    async fn create_database(
        &self,
        _token: &CancellationToken,
        org: &OrganizationConfig,
        _server_identity: &IdentityHandle,
        _migration_identity: &IdentityHandle,
    ) -> Result<()> {
        self.record(format!("create_database:{}", org.cloud.database_name))
    }

    async fn delete_database(&self, _token: &CancellationToken, org: &OrganizationConfig) -> Result<()> {
        self.record(format!("delete_database:{}", org.cloud.database_name))
    }

    async fn assign_dns_record(&self, _token: &CancellationToken, org: &OrganizationConfig) -> Result<()> {
        self.record(format!("assign_dns_record:{}", org.name))
    }

    async fn delete_dns_record(&self, _token: &CancellationToken, org: &OrganizationConfig) -> Result<()> {
        self.record(format!("delete_dns_record:{}", org.name))
    }
}

fn handle(cluster: &ClusterConfig) -> ClusterHandle {
    ClusterHandle {
        name: cluster.name.clone(),
        resource_group: "demo".to_string(),
        location: cluster.location.clone(),
        oidc_issuer_url: format!("https://oidc.example.com/{}", cluster.name),
        api_host: cluster.api_host,
    }
}
