// ABOUTME: Command implementations behind the CLI subcommands
// ABOUTME: Builds the pipeline from configuration and exports run, plan, stale, environments

pub mod environments;
pub mod plan;
pub mod run;
pub mod stale;

pub use environments::environments;
pub use plan::plan;
pub use run::run;
pub use stale::stale;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::Config;
use crate::mirror::Pipeline;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::postgres::{ConnectOptions, PostgresConnector, PostgresWarehouse};
use crate::utils::mask_password;

/// Validate the configuration and connect the warehouse and notifier.
///
/// Source connections are opened lazily, per environment, when a run reaches them.
pub async fn build_pipeline(config: &Config, options: ConnectOptions) -> Result<Pipeline> {
    config.validate()?;

    let warehouse_url = config
        .warehouse
        .url
        .as_deref()
        .context("No warehouse URL configured")?;
    tracing::info!("Connecting to warehouse {}", mask_password(warehouse_url));
    let warehouse = PostgresWarehouse::connect(warehouse_url, config.warehouse.pool_size, &options)
        .await
        .context("Failed to open warehouse")?;

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => {
            tracing::info!("No webhook configured, alerts will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let mut pipeline = Pipeline::new(Arc::new(warehouse), notifier, config.sync_options()?);
    for env in &config.environments {
        pipeline.add_environment(
            &env.name,
            Arc::new(PostgresConnector::new(env.url.clone(), options)),
        );
    }
    Ok(pipeline)
}
