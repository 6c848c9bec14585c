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
    skip_shared: bool,
) -> Result<()> {
    let mut config = load_config(file)?;
    config.apply_multi_org_filter(orgs)?;

    println!(
        "{} {}",
        "Installing environment".blue(),
        config.environment_name.cyan()
    );

    let provisioner = Arc::new(AzureCliProvisioner::new(config.clone())?);
    let installer = Installer::new(config, provisioner);
    let report = installer.install_cloud(token, skip_shared).await?;

    println!("{} ({})", "✓ Install complete".green().bold(), report);
    Ok(())
}
