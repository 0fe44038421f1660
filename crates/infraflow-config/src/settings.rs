//! settings.yaml の読み込み
//!
//! グローバル設定 (~/.config/infraflow/settings.yaml) をプロジェクト設定
//! (./.infraflow/settings.yaml) で上書きする。

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.yaml";

/// ポーリングの既定値。未指定の項目はオーケストレーターの既定値を使う
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollSettings {
    pub timeout_secs: Option<u64>,
    pub initial_interval_ms: Option<u64>,
    pub max_interval_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<f64>,
    pub min_interval_ms: Option<u64>,
    pub initial_delay_ms: Option<u64>,
    pub not_found_tolerance: Option<u32>,
    pub continuous_target: Option<u32>,
}

impl PollSettings {
    /// `other` で指定された項目だけを上書き
    fn merge(self, other: PollSettings) -> Self {
        Self {
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
            initial_interval_ms: other.initial_interval_ms.or(self.initial_interval_ms),
            max_interval_ms: other.max_interval_ms.or(self.max_interval_ms),
            multiplier: other.multiplier.or(self.multiplier),
            jitter: other.jitter.or(self.jitter),
            min_interval_ms: other.min_interval_ms.or(self.min_interval_ms),
            initial_delay_ms: other.initial_delay_ms.or(self.initial_delay_ms),
            not_found_tolerance: other.not_found_tolerance.or(self.not_found_tolerance),
            continuous_target: other.continuous_target.or(self.continuous_target),
        }
    }
}

/// 外部コマンドで動くプロバイダーの設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found_exit_code: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_map: Option<BTreeMap<String, String>>,
}

/// InfraFlow の実行設定
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub poll: PollSettings,

    /// 同時に実行するオペレーション数の上限
    pub max_parallel: Option<usize>,

    /// quota.json の出力先
    pub quota_dir: Option<PathBuf>,

    /// プロバイダー名 -> コマンド設定
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Settings {
    pub fn from_yaml(content: &str, path: impl AsRef<Path>) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content).map_err(|source| {
            ConfigError::Parse {
                path: path.as_ref().to_path_buf(),
                source,
            }
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, path)
    }

    /// `other` を優先して統合する。プロバイダーは名前単位で置き換え
    pub fn merge(self, other: Settings) -> Self {
        let mut providers = self.providers;
        providers.extend(other.providers);
        Self {
            poll: self.poll.merge(other.poll),
            max_parallel: other.max_parallel.or(self.max_parallel),
            quota_dir: other.quota_dir.or(self.quota_dir),
            providers,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(multiplier) = self.poll.multiplier {
            if multiplier.is_nan() || multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "poll.multiplier は 1.0 以上である必要があります: {}",
                    multiplier
                )));
            }
        }
        if let Some(jitter) = self.poll.jitter {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::Invalid(format!(
                    "poll.jitter は 0.0 から 1.0 の範囲で指定してください: {}",
                    jitter
                )));
            }
        }
        if let (Some(initial), Some(max)) = (self.poll.initial_interval_ms, self.poll.max_interval_ms)
        {
            if initial > max {
                return Err(ConfigError::Invalid(format!(
                    "poll.initial_interval_ms ({}) が poll.max_interval_ms ({}) を超えています",
                    initial, max
                )));
            }
        }
        if self.max_parallel == Some(0) {
            return Err(ConfigError::Invalid(
                "max_parallel は 1 以上である必要があります".to_string(),
            ));
        }
        for (name, provider) in &self.providers {
            if provider.program.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "providers.{}.program が空です",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
poll:
  timeout_secs: 600
  initial_interval_ms: 2000
  multiplier: 2.0
max_parallel: 4
providers:
  aws:
    program: infraflow-aws
    args: ["--region", "ap-northeast-1"]
    status_map:
      running: ACTIVE
      pending: CREATING
"#;

    #[test]
    fn test_parse_settings() {
        let settings = Settings::from_yaml(SAMPLE, "settings.yaml").unwrap();
        assert_eq!(settings.poll.timeout_secs, Some(600));
        assert_eq!(settings.poll.jitter, None);
        assert_eq!(settings.max_parallel, Some(4));

        let aws = &settings.providers["aws"];
        assert_eq!(aws.program, "infraflow-aws");
        assert_eq!(aws.args, vec!["--region", "ap-northeast-1"]);
        assert_eq!(aws.status_field, None);
        assert_eq!(aws.status_map.as_ref().unwrap()["running"], "ACTIVE");
    }

    #[test]
    fn test_empty_settings() {
        let settings = Settings::from_yaml("{}", "settings.yaml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Settings::from_yaml("max_paralel: 2", "settings.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for yaml in [
            "poll: { multiplier: 0.5 }",
            "poll: { jitter: 1.5 }",
            "poll: { initial_interval_ms: 5000, max_interval_ms: 1000 }",
            "max_parallel: 0",
            "providers: { aws: { program: '' } }",
        ] {
            let err = Settings::from_yaml(yaml, "settings.yaml").unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{yaml}");
        }
    }

    #[test]
    fn test_merge_prefers_project_values() {
        let global = Settings::from_yaml(SAMPLE, "global.yaml").unwrap();
        let project = Settings::from_yaml(
            r#"
poll:
  timeout_secs: 60
providers:
  gcp:
    program: infraflow-gcp
"#,
            "project.yaml",
        )
        .unwrap();

        let merged = global.merge(project);
        assert_eq!(merged.poll.timeout_secs, Some(60));
        assert_eq!(merged.poll.initial_interval_ms, Some(2000));
        assert_eq!(merged.max_parallel, Some(4));
        assert!(merged.providers.contains_key("aws"));
        assert!(merged.providers.contains_key("gcp"));
    }
}
