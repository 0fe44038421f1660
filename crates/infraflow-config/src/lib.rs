pub mod error;
pub mod settings;

pub use error::*;
pub use settings::{PollSettings, ProviderSettings, SETTINGS_FILE, Settings};

use std::path::PathBuf;

/// プロジェクト単位の設定ディレクトリ名
pub const PROJECT_DIR: &str = ".infraflow";

/// InfraFlowの設定ディレクトリを取得 (~/.config/infraflow)
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("infraflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// プロジェクトのプランファイルを探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 INFRAFLOW_PLAN_PATH (直接パス指定)
/// 2. カレントディレクトリ: infra.local.yaml, infra.yaml, .infra.yaml
/// 3. ./.infraflow/ ディレクトリ内: 同様の順序
/// 4. ~/.config/infraflow/infra.yaml (グローバル設定)
pub fn find_plan_file() -> Result<PathBuf> {
    if let Ok(plan_path) = std::env::var("INFRAFLOW_PLAN_PATH") {
        let path = PathBuf::from(plan_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let candidates = ["infra.local.yaml", "infra.yaml", ".infra.yaml"];

    for filename in &candidates {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(PROJECT_DIR);
    if project_dir.is_dir() {
        for filename in &candidates {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_plan = config_dir.join("infraflow").join("infra.yaml");
        if global_plan.exists() {
            return Ok(global_plan);
        }
    }

    Err(ConfigError::PlanFileNotFound)
}

/// 設定を読み込む
///
/// ~/.config/infraflow/settings.yaml を ./.infraflow/settings.yaml で上書きする。
/// どちらも無ければ既定値。
pub fn load_settings() -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(config_dir) = dirs::config_dir() {
        let global = config_dir.join("infraflow").join(SETTINGS_FILE);
        if global.exists() {
            settings = Settings::from_file(&global)?;
        }
    }

    let project = std::env::current_dir()?
        .join(PROJECT_DIR)
        .join(SETTINGS_FILE);
    if project.exists() {
        settings = settings.merge(Settings::from_file(&project)?);
    }

    Ok(settings)
}
