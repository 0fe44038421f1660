use crate::utils;
use colored::Colorize;
use infraflow_cloud::QuotaFootprint;
use std::path::PathBuf;

pub async fn handle(dir: Option<PathBuf>) -> anyhow::Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => {
            let settings = infraflow_config::load_settings()?;
            utils::quota_dir(&settings, &std::env::current_dir()?)
        }
    };

    let footprint = match QuotaFootprint::read(&dir).await {
        Ok(footprint) => footprint,
        Err(e) => {
            eprintln!("{}", "✗ quota.json を読み込めません".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };

    println!(
        "{}",
        QuotaFootprint::path(&dir).display().to_string().cyan()
    );
    if footprint.is_empty() {
        println!("{}", "使用中のリソースはありません".dimmed());
        return Ok(());
    }
    for (resource_type, units) in footprint.iter() {
        println!("  {:<20} {}", resource_type, units);
    }

    Ok(())
}
