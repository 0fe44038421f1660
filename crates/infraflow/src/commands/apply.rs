use crate::utils;
use colored::Colorize;
use std::path::PathBuf;

pub async fn handle(plan: Option<PathBuf>, yes: bool, dry_run: bool) -> anyhow::Result<()> {
    println!("{}", "プランを読み込み中...".blue());
    let path = utils::resolve_plan_path(plan)?;
    println!("プランファイル: {}", path.display().to_string().cyan());

    let plan = utils::load_plan(&path)?;
    let settings = infraflow_config::load_settings()?;
    utils::print_plan(&plan)?;

    if plan.is_empty() {
        println!();
        println!("{}", "実行するオペレーションはありません".dimmed());
        return Ok(());
    }

    if dry_run {
        println!();
        println!("{}", "--dry-run: 変更は行いません".dimmed());
        return Ok(());
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        println!();
        println!("実行するには --yes オプションを指定してください");
        return Ok(());
    }

    utils::run_plan(&plan, &settings, "apply").await
}
