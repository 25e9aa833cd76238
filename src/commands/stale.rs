// ABOUTME: Watchdog-only command - reports and alerts on stale changed tables

use anyhow::{bail, Result};
use chrono::Utc;

use crate::mirror::Pipeline;

pub async fn stale(pipeline: &Pipeline) -> Result<()> {
    let mut errors = 0;
    for (environment, result) in pipeline.watch(Utc::now()).await {
        match result {
            Ok(tables) if tables.is_empty() => {
                println!("✓ {}: all changed tables are fresh", environment)
            }
            Ok(tables) => {
                println!("⚠ {}: {} stale table(s)", environment, tables.len());
                for (table, date) in tables {
                    println!("    {} (last refreshed {})", table, date);
                }
            }
            Err(e) => {
                errors += 1;
                println!("✗ {}: {:#}", environment, e);
            }
        }
    }

    if errors > 0 {
        bail!("Staleness check failed for {} environment(s)", errors);
    }
    Ok(())
}
