// ABOUTME: Mirror command - full pipeline for every environment plus the watchdog
// ABOUTME: Prints a per-environment summary and optionally saves a JSON report

use anyhow::{bail, Result};
use std::path::Path;

use crate::mirror::{Pipeline, RunReport};

pub async fn run(pipeline: &Pipeline, report_path: Option<&Path>) -> Result<()> {
    let report = pipeline.run().await;
    print_summary(&report);

    if let Some(path) = report_path {
        report.save(path).await?;
        println!("Run report written to {}", path.display());
    }

    let failed = report
        .environments
        .values()
        .filter(|e| !e.succeeded())
        .count();
    if failed > 0 {
        bail!("{} environment(s) finished with errors", failed);
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    for env in report.environments.values() {
        println!();
        println!("Environment {}", env.environment);
        if let Some(error) = &env.error {
            println!("  ✗ {}", error);
            continue;
        }

        for table in env.tables.values() {
            let strategy = table
                .strategy
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unresolved".to_string());
            match &table.error {
                None => println!(
                    "  ✓ {:<32} {} (staged {}, pruned {}, inserted {})",
                    table.table, strategy, table.rows_staged, table.rows_pruned, table.rows_inserted
                ),
                Some(error) => println!("  ✗ {:<32} {}", table.table, error),
            }
        }

        if !env.stale_tables.is_empty() {
            println!("  Stale tables:");
            for (table, date) in &env.stale_tables {
                println!("    {} (last refreshed {})", table, date);
            }
        }
    }
}
