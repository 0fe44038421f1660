use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("設定ディレクトリが見つかりません")]
    ConfigDirNotFound,

    #[error(
        "プランファイルが見つかりません。以下の場所を確認してください:\n\
        - カレントディレクトリ: infra.local.yaml, infra.yaml, .infra.yaml\n\
        - ./.infraflow/ ディレクトリ\n\
        - ~/.config/infraflow/infra.yaml\n\
        または INFRAFLOW_PLAN_PATH 環境変数で直接指定できます"
    )]
    PlanFileNotFound,

    #[error("設定ファイルの解析に失敗しました ({path}): {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("設定値が不正です: {0}")]
    Invalid(String),

    #[error("IO エラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
