use colored::Colorize;
use infraflow_cloud::{ResourceState, StateManager};

pub async fn handle(provider: Option<String>) -> anyhow::Result<()> {
    let project_root = std::env::current_dir()?;
    let manager = StateManager::new(&project_root);
    let state = manager.load().await?;

    println!(
        "状態ファイル: {}",
        manager.state_dir().display().to_string().cyan()
    );

    let resources: Vec<(&str, &ResourceState)> = match provider.as_deref() {
        Some(provider) => state.provider_resources(provider).collect(),
        None => state
            .resources
            .iter()
            .map(|(key, resource)| (key.as_str(), resource))
            .collect(),
    };

    if resources.is_empty() {
        println!("{}", "記録されたリソースはありません".dimmed());
        return Ok(());
    }

    println!();
    let title = match provider.as_deref() {
        Some(provider) => format!("リソース一覧 [{}] ({} 個):", provider, resources.len()),
        None => format!("リソース一覧 ({} 個):", resources.len()),
    };
    println!("{}", title.bold());
    for (key, resource) in resources {
        let status = resource
            .status
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  • {} id={} status={} {}",
            key.cyan(),
            resource.id,
            status,
            format!("(更新: {})", resource.updated_at.format("%Y-%m-%d %H:%M:%S")).dimmed()
        );
    }

    Ok(())
}
