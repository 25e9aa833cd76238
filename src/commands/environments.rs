// ABOUTME: Lists configured environments with their passwords masked

use anyhow::Result;

use crate::config::Config;
use crate::warehouse::{DatasetKind, DatasetRef};

pub fn environments(config: &Config) -> Result<()> {
    if config.environments.is_empty() {
        println!("No environments configured.");
        return Ok(());
    }

    let schema = &config.sync.source_schema;
    for env in config.environments.iter().map(|e| e.masked()) {
        println!("{}", env.name);
        println!("  source:  {} (schema {})", env.url, schema);
        println!(
            "  datasets: {}, {}, {}",
            DatasetRef::new(DatasetKind::Final, &env.name),
            DatasetRef::new(DatasetKind::Changed, &env.name),
            DatasetRef::new(DatasetKind::UnchangedIds, &env.name)
        );
    }
    Ok(())
}
