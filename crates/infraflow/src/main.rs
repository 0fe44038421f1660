mod commands;
mod utils;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "infra")]
#[command(about = "宣言する。待つ。インフラは依存順に収束する。", long_about = None)]
struct Cli {
    /// デバッグログを表示 (RUST_LOG が優先)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// プランを適用してリソースを作成・更新
    Apply {
        /// プランファイル (省略時は自動検出)
        plan: Option<PathBuf>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
        /// 実行順序を表示するだけで何も変更しない
        #[arg(long)]
        dry_run: bool,
    },
    /// プランのリソースを依存関係の逆順で削除
    Destroy {
        /// プランファイル (省略時は自動検出)
        plan: Option<PathBuf>,
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// プランを検証して実行順序を表示
    Validate {
        /// プランファイル (省略時は自動検出)
        plan: Option<PathBuf>,
    },
    /// 記録済みのリソース状態を表示
    Status {
        /// このプロバイダーのリソースのみ表示
        provider: Option<String>,
    },
    /// quota.json を表示
    Quota {
        /// quota.json のあるディレクトリ (省略時は設定値)
        dir: Option<PathBuf>,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ログはstderrへ。stdoutはコマンドの出力専用
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Apply { plan, yes, dry_run } => {
            commands::apply::handle(plan, yes, dry_run).await?;
        }
        Commands::Destroy { plan, yes } => {
            commands::destroy::handle(plan, yes).await?;
        }
        Commands::Validate { plan } => {
            commands::validate::handle(plan)?;
        }
        Commands::Status { provider } => {
            commands::status::handle(provider).await?;
        }
        Commands::Quota { dir } => {
            commands::quota::handle(dir).await?;
        }
        Commands::Version => {
            println!("infraflow {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
