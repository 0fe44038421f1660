use crate::utils;
use colored::Colorize;
use std::path::PathBuf;

pub fn handle(plan: Option<PathBuf>) -> anyhow::Result<()> {
    println!("{}", "プランを検証中...".blue());

    let path = match utils::resolve_plan_path(plan) {
        Ok(path) => path,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ プランファイルが見つかりません".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };
    println!("プランファイル: {}", path.display().to_string().cyan());

    let plan = match utils::load_plan(&path) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ プランエラー".red().bold());
            eprintln!("  {:#}", e);
            std::process::exit(1);
        }
    };

    println!("{}", "✓ プランは正常です！".green().bold());
    utils::print_plan(&plan)?;

    // プロバイダー設定は実行時に必要になるので警告のみ
    match infraflow_config::load_settings() {
        Ok(settings) => {
            if let Err(e) = utils::check_providers(&plan, &settings) {
                println!();
                println!("{} {}", "⚠".yellow(), e);
            }
        }
        Err(e) => {
            println!();
            println!("{} 設定を読み込めません: {}", "⚠".yellow(), e);
        }
    }

    Ok(())
}
