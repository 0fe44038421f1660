use crate::utils;
use colored::Colorize;
use std::path::PathBuf;

pub async fn handle(plan: Option<PathBuf>, yes: bool) -> anyhow::Result<()> {
    println!("{}", "プランを読み込み中...".blue());
    let path = utils::resolve_plan_path(plan)?;
    println!("プランファイル: {}", path.display().to_string().cyan());

    // 依存関係を反転: 依存される側が最後に削除される
    let plan = utils::load_plan(&path)?.reversed();
    let settings = infraflow_config::load_settings()?;
    utils::print_plan(&plan)?;

    if plan.is_empty() {
        println!();
        println!("{}", "削除するリソースはありません".dimmed());
        return Ok(());
    }

    if !yes {
        println!();
        println!(
            "{}",
            format!("⚠ {}個のリソースを削除します", plan.len()).red().bold()
        );
        println!("  リソースは復旧できません。実行するには --yes を指定してください。");
        return Ok(());
    }

    utils::run_plan(&plan, &settings, "destroy").await
}
