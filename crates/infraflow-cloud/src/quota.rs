//! Quota footprint of a provisioning run
//!
//! Written once as `quota.json` after a successful run and read by cleanup
//! and cost tooling. Contains counts only, no secrets.

use crate::action::{ActionType, Plan};
use crate::error::{CloudError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

pub const QUOTA_FILE: &str = "quota.json";

/// Consumed units per resource type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaFootprint {
    usage: BTreeMap<String, u64>,
}

impl QuotaFootprint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum the units of every create and update in `plan`
    pub fn from_plan(plan: &Plan) -> Self {
        let mut footprint = Self::new();
        for op in &plan.operations {
            if op.action != ActionType::Delete {
                footprint.add(&op.key.resource_type, op.units);
            }
        }
        footprint
    }

    pub fn add(&mut self, resource_type: &str, units: u64) {
        let entry = self.usage.entry(resource_type.to_string()).or_insert(0);
        *entry = entry.saturating_add(units);
    }

    pub fn get(&self, resource_type: &str) -> u64 {
        self.usage.get(resource_type).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.usage.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.usage.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn path(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join(QUOTA_FILE)
    }

    /// Write `dir/quota.json`, replacing any previous file in one rename
    pub async fn write(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        let path = Self::path(dir);
        let tmp = dir.join(format!(".{}.tmp", QUOTA_FILE));
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, content).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o644)).await?;
        }

        fs::rename(&tmp, &path).await?;
        tracing::debug!("Wrote quota footprint to {}", path.display());
        Ok(path)
    }

    /// Read `dir/quota.json`
    pub async fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let path = Self::path(dir);
        if !path.exists() {
            return Err(CloudError::StateError(format!(
                "quota footprint not found: {}",
                path.display()
            )));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl FromIterator<(String, u64)> for QuotaFootprint {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        let mut footprint = Self::new();
        for (resource_type, units) in iter {
            footprint.add(&resource_type, units);
        }
        footprint
    }
}
