use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use cadeploy_cluster::KubeClusterApi;
use cadeploy_core::{
    ChangeImageOptions, CreateOptions, DeleteOptions, DeployerConfig, DeploymentId, UpdateOptions,
};
use cadeploy_manager::DeploymentManager;
use tracing::{debug, warn};

async fn connect(config_path: &Path) -> anyhow::Result<DeploymentManager> {
    let config = DeployerConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    debug!(
        path = %config_path.display(),
        app_namespace = %config.app.namespace,
        redis_namespace = %config.redis.namespace,
        "configuration loaded"
    );
    let cluster = KubeClusterApi::connect(config.use_kube_config).await?;
    Ok(DeploymentManager::new(Arc::new(cluster), Arc::new(config)))
}

fn parse_id(id: &str) -> anyhow::Result<DeploymentId> {
    Ok(DeploymentId::parse(id)?)
}

pub async fn create(
    config: &Path,
    id: &str,
    image: &str,
    is_untrusted: bool,
    plan: &str,
    timestamp: Option<String>,
) -> anyhow::Result<()> {
    let mut opts = CreateOptions::new(parse_id(id)?, image, is_untrusted, plan);
    opts.timestamp = timestamp;
    // Reject bad input before touching the cluster.
    opts.validate()?;

    let manager = connect(config).await?;
    manager.create_app(&opts).await?;
    println!("OK");
    Ok(())
}

pub async fn flex(config: &Path, id: &str, plan: &str, number_of_cas: u32) -> anyhow::Result<()> {
    let opts = UpdateOptions {
        id: parse_id(id)?,
        plan: plan.to_string(),
        number_of_cas,
        current_props: None,
    };
    let manager = connect(config).await?;
    let outcome = manager.update_app(&opts).await?;
    debug!(
        instances = outcome.props.app.instances,
        dedicated_disk = outcome.dedicated_disk,
        applied = ?outcome.applied,
        "flexed"
    );
    println!("OK");
    Ok(())
}

pub async fn change_image(config: &Path, id: &str, image: &str) -> anyhow::Result<()> {
    let opts = ChangeImageOptions {
        id: parse_id(id)?,
        image: image.to_string(),
        current_props: None,
    };
    let manager = connect(config).await?;
    manager.change_image(&opts).await?;
    println!("OK");
    Ok(())
}

pub async fn stat(config: &Path) -> anyhow::Result<()> {
    let manager = connect(config).await?;
    let status = manager.stat_all().await?;
    println!("{}", serde_json::to_string_pretty(status.as_ref())?);
    Ok(())
}

pub async fn delete(config: &Path, id: &str, keep_data: bool) -> anyhow::Result<()> {
    let opts = DeleteOptions {
        id: parse_id(id)?,
        timestamp: None,
        keep_data,
    };
    let manager = connect(config).await?;
    let report = manager.delete_app(&opts).await?;
    if !report.is_clean() {
        for step in report.failures() {
            warn!(
                kind = %step.kind,
                namespace = %step.namespace,
                name = %step.name,
                outcome = ?step.outcome,
                "not deleted"
            );
        }
        bail!("{} objects could not be deleted", report.failures().count());
    }
    println!("OK");
    Ok(())
}

pub async fn restart(config: &Path, id: &str) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let manager = connect(config).await?;
    manager.restart_app(&id).await?;
    println!("OK");
    Ok(())
}

/// Write a scaffold configuration, refusing to overwrite.
pub fn init(config: &Path, app_namespace: &str, redis_namespace: &str) -> anyhow::Result<()> {
    if config.exists() {
        bail!("{} already exists", config.display());
    }
    let scaffold = DeployerConfig::scaffold(app_namespace, redis_namespace);
    std::fs::write(config, scaffold.to_toml_string()?)?;
    println!("✓ Generated {}", config.display());
    Ok(())
}
