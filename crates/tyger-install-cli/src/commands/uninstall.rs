use super::load_config;
use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tyger_install::{Installer, Result};
use tyger_install_azure::AzureCliProvisioner;

pub async fn handle(
    token: &CancellationToken,
    file: &Path,
    orgs: &[String],
    all: bool,
) -> Result<()> {
    let mut config = load_config(file)?;
    config.apply_multi_org_filter(orgs)?;

    let target = if all {
        format!("environment {}", config.environment_name.cyan())
    } else {
        let names: Vec<&str> = config.organizations.iter().map(|o| o.name.as_str()).collect();
        format!("organizations {}", names.join(", ").cyan())
    };
    println!("{} {}", "Uninstalling".blue(), target);

    let provisioner = Arc::new(AzureCliProvisioner::new(config.clone())?);
    let installer = Installer::new(config, provisioner);
    installer.uninstall_cloud(token, all).await?;

    println!("{}", "✓ Uninstall complete".green().bold());
    Ok(())
}
