// ABOUTME: Dry run - shows which strategy each table would use
// ABOUTME: Reads source catalogs and warehouse metadata only

use anyhow::Result;

use crate::mirror::Pipeline;

pub async fn plan(pipeline: &Pipeline) -> Result<()> {
    for plan in pipeline.plan().await {
        println!("Environment {}", plan.environment);
        if let Some(error) = &plan.error {
            println!("  ✗ {}", error);
            continue;
        }
        for (table, strategy) in &plan.tables {
            println!("  {:<32} {}", table, strategy);
        }
        for (table, error) in &plan.failures {
            println!("  ✗ {:<32} {}", table, error);
        }
    }
    Ok(())
}
