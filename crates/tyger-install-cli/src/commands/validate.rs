use super::load_config;
use colored::Colorize;
use std::path::Path;
use tyger_install::Result;

pub fn handle(file: &Path) -> Result<()> {
    let config = load_config(file)?;

    println!("{}", "✓ Configuration is valid".green().bold());
    println!();
    println!("Summary:");
    println!("  Environment: {}", config.environment_name.cyan());
    println!("  Resource group: {}", config.cloud.resource_group);
    println!("  Clusters: {}", config.cloud.compute.clusters.len());
    for cluster in &config.cloud.compute.clusters {
        let role = if cluster.api_host { ", API host" } else { "" };
        println!("    - {} ({}{})", cluster.name.cyan(), cluster.location, role);
    }
    println!("  Organizations: {}", config.organizations.len());
    for org in &config.organizations {
        println!("    - {} ({})", org.name.cyan(), org.api.domain_name);
    }
    Ok(())
}
