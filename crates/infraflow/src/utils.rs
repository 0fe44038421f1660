use anyhow::Context;
use colored::Colorize;
use infraflow_backend_command::{CommandBackend, CommandBackendConfig};
use infraflow_cloud::{
    ActionType, BackendRegistry, CancellationToken, Orchestrator, Plan, PollProfile, RunReport,
    StateManager, TerminalState,
};
use infraflow_config::{PROJECT_DIR, PollSettings, ProviderSettings, Settings};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// 引数で指定されたプランファイル、なければ自動検出したもの
pub fn resolve_plan_path(plan: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match plan {
        Some(path) => Ok(path),
        None => Ok(infraflow_config::find_plan_file()?),
    }
}

/// プランファイル (YAML) を読み込んで検証
pub fn load_plan(path: &Path) -> anyhow::Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("プランファイルを読み込めません: {}", path.display()))?;
    let plan: Plan = serde_yaml::from_str(&content)
        .with_context(|| format!("プランファイルの解析に失敗しました: {}", path.display()))?;
    plan.validate()?;
    Ok(plan)
}

/// 設定されていないプロバイダーを使うオペレーションがあればエラー
pub fn check_providers(plan: &Plan, settings: &Settings) -> anyhow::Result<()> {
    let mut missing: Vec<&str> = plan
        .operations
        .iter()
        .map(|op| op.key.provider.as_str())
        .filter(|provider| !settings.providers.contains_key(*provider))
        .collect();
    missing.sort_unstable();
    missing.dedup();

    if !missing.is_empty() {
        anyhow::bail!(
            "プロバイダーが設定されていません: {}\nsettings.yaml の providers に追加してください",
            missing.join(", ")
        );
    }
    Ok(())
}

pub fn build_registry(settings: &Settings) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    for (name, provider) in &settings.providers {
        tracing::debug!("Registering provider {} ({})", name, provider.program);
        registry.register(Arc::new(CommandBackend::new(name, backend_config(provider))));
    }
    registry
}

fn backend_config(provider: &ProviderSettings) -> CommandBackendConfig {
    let mut config = CommandBackendConfig::new(&provider.program);
    config.args = provider.args.clone();
    if let Some(field) = &provider.status_field {
        config.status_field = field.clone();
    }
    if let Some(code) = provider.not_found_exit_code {
        config.not_found_exit_code = code;
    }
    config.status_map = provider.status_map.clone();
    config
}

/// 設定値で既定のポーリングプロファイルを上書き
pub fn poll_profile(poll: &PollSettings) -> PollProfile {
    let mut profile = PollProfile::default();

    if let Some(secs) = poll.timeout_secs {
        profile.timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = poll.initial_interval_ms {
        profile.backoff.initial = Duration::from_millis(ms);
    }
    if let Some(ms) = poll.max_interval_ms {
        profile.backoff.max = Duration::from_millis(ms);
    }
    if let Some(multiplier) = poll.multiplier {
        profile.backoff = profile.backoff.with_multiplier(multiplier);
    }
    if let Some(jitter) = poll.jitter {
        profile.backoff = profile.backoff.with_jitter(jitter);
    }
    if let Some(ms) = poll.min_interval_ms {
        profile.min_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = poll.initial_delay_ms {
        profile.initial_delay = Duration::from_millis(ms);
    }
    if let Some(checks) = poll.not_found_tolerance {
        profile.not_found_tolerance = checks;
    }
    if let Some(ticks) = poll.continuous_target {
        profile.continuous_target = ticks;
    }
    profile
}

/// quota.json の出力先 (未設定なら ./.infraflow)
pub fn quota_dir(settings: &Settings, project_root: &Path) -> PathBuf {
    settings
        .quota_dir
        .clone()
        .unwrap_or_else(|| project_root.join(PROJECT_DIR))
}

fn action_symbol(action: ActionType) -> colored::ColoredString {
    match action {
        ActionType::Create => "+".green(),
        ActionType::Update => "~".yellow(),
        ActionType::Delete => "-".red(),
    }
}

/// 実行順序 (段階ごと) を表示
pub fn print_plan(plan: &Plan) -> anyhow::Result<()> {
    let layers = plan.layers()?;

    println!();
    println!("{}", format!("実行計画: {}", plan.summary()).bold());
    for (i, layer) in layers.iter().enumerate() {
        println!("  段階 {}:", i + 1);
        for key in layer {
            let Some(op) = plan.get(key) else {
                continue;
            };
            let deps = if op.depends_on.is_empty() {
                String::new()
            } else {
                let names: Vec<String> = op.depends_on.iter().map(|d| d.to_string()).collect();
                format!(" (依存: {})", names.join(", ")).dimmed().to_string()
            };
            println!(
                "    {} {} [{}]{}",
                action_symbol(op.action),
                key.to_string().cyan(),
                op.action,
                deps
            );
        }
    }
    Ok(())
}

/// Ctrl-C で実行中の待機をキャンセル
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{}", "中断しています... 実行中の待機を停止します".yellow());
            cancel.cancel();
        }
    });
}

/// プランを実行して結果を表示する。失敗があれば終了コード 1 で終了
pub async fn run_plan(plan: &Plan, settings: &Settings, command: &'static str) -> anyhow::Result<()> {
    check_providers(plan, settings)?;

    let project_root = std::env::current_dir()?;
    let mut orchestrator = Orchestrator::new(build_registry(settings))
        .with_profile(poll_profile(&settings.poll))
        .with_state(StateManager::new(&project_root))
        .with_quota_dir(quota_dir(settings, &project_root))
        .with_span(tracing::info_span!("infra", command));
    if let Some(limit) = settings.max_parallel {
        orchestrator = orchestrator.with_max_parallel(limit);
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    println!();
    println!("{}", "実行中...".blue());
    let report = orchestrator.execute(plan, cancel.clone()).await?;
    print_report(&report);

    if report.is_success() {
        println!();
        println!(
            "{}",
            format!(
                "✓ {}個のオペレーションが完了しました ({:.1}秒)",
                report.operations.len(),
                report.elapsed.as_secs_f64()
            )
            .green()
            .bold()
        );
        if let Some(footprint) = &report.footprint {
            if !footprint.is_empty() {
                println!(
                    "  quota: {}",
                    quota_dir(settings, &project_root)
                        .join(infraflow_cloud::QUOTA_FILE)
                        .display()
                        .to_string()
                        .dimmed()
                );
            }
        }
        return Ok(());
    }

    print_failures(&report);
    if cancel.is_cancelled() {
        eprintln!("{}", "実行は中断されました".yellow());
    }
    std::process::exit(1);
}

fn print_report(report: &RunReport) {
    for op in &report.operations {
        let detail = format!(
            "{}回確認, {:.1}秒",
            op.attempts,
            op.elapsed.as_secs_f64()
        );
        match op.state {
            TerminalState::Converged => {
                let status = op
                    .status
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "absent".to_string());
                println!(
                    "  {} {} {} ({})",
                    "✓".green(),
                    op.key.to_string().cyan(),
                    status,
                    detail.dimmed()
                );
            }
            state => {
                println!(
                    "  {} {} [{}] ({})",
                    "✗".red(),
                    op.key.to_string().cyan(),
                    state,
                    detail.dimmed()
                );
            }
        }
    }
    for key in &report.skipped {
        println!("  {} {} {}", "⊘".yellow(), key.to_string().cyan(), "未実行".dimmed());
    }
}

fn print_failures(report: &RunReport) {
    let failures = report.failures();

    eprintln!();
    eprintln!(
        "{}",
        format!("✗ {}個のオペレーションが失敗しました", failures.len())
            .red()
            .bold()
    );
    for failure in failures.iter() {
        eprintln!(
            "  - {} [{}]: {}",
            failure.key.to_string().cyan(),
            failure.state,
            failure.error
        );
    }
    if !report.skipped.is_empty() {
        eprintln!(
            "{}",
            format!(
                "  依存先が完了しなかったため {}個のオペレーションを実行しませんでした",
                report.skipped.len()
            )
            .yellow()
        );
    }
}
