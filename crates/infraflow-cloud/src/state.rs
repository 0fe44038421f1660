//! State management for provisioned resources
//!
//! Manages the `.infraflow/state.json` file which records every resource a
//! run created, so a later run (or a teardown) knows their IDs.

use crate::error::{CloudError, Result};
use crate::key::{ResourceKey, StatusToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const STATE_VERSION: u32 = 1;
pub const STATE_DIR: &str = ".infraflow";
const STATE_FILE: &str = "state.json";
const STATE_BACKUP: &str = "state.json.backup";
const STATE_TMP: &str = "state.json.tmp";
const LOCK_FILE: &str = "lock.json";
const LOCK_STALE_HOURS: i64 = 1;

/// Global state containing all provisioned resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalState {
    /// State file version
    pub version: u32,

    /// Last modified timestamp
    pub updated_at: DateTime<Utc>,

    /// Resources indexed by `provider/type/name`
    pub resources: BTreeMap<String, ResourceState>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resources whose key starts with `provider/`, in key order
    pub fn provider_resources<'a>(
        &'a self,
        provider: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ResourceState)> + 'a {
        self.resources
            .iter()
            .filter(move |(k, _)| {
                k.strip_prefix(provider)
                    .is_some_and(|rest| rest.starts_with('/'))
            })
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Add or update a resource
    pub fn set_resource(&mut self, key: &ResourceKey, state: ResourceState) {
        self.resources.insert(key.to_string(), state);
        self.updated_at = Utc::now();
    }

    /// Remove a resource
    pub fn remove_resource(&mut self, key: &ResourceKey) -> Option<ResourceState> {
        let removed = self.resources.remove(&key.to_string());
        if removed.is_some() {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn get_resource(&self, key: &ResourceKey) -> Option<&ResourceState> {
        self.resources.get(&key.to_string())
    }
}

/// Last known state of one provisioned resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceState {
    /// Provider-assigned ID
    pub id: String,

    pub resource_type: String,

    /// Last observed status
    pub status: Option<StatusToken>,

    /// Every field of the last describe result
    pub attributes: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            status: None,
            attributes: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Build from a describe result: `id` comes from the value's `id` field
    /// (falling back to the key name), every object field becomes an attribute.
    pub fn from_observed(
        key: &ResourceKey,
        value: &serde_json::Value,
        status: Option<StatusToken>,
    ) -> Self {
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(&key.name)
            .to_string();
        let mut state = Self::new(id, key.resource_type.clone());
        state.status = status;
        if let Some(object) = value.as_object() {
            state.attributes = object
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
        }
        state
    }
}

/// Reads and writes `<project>/.infraflow/state.json`
#[derive(Debug, Clone)]
pub struct StateManager {
    project_root: PathBuf,
}

impl StateManager {
    pub fn new(project_root: impl AsRef<Path>) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_root.join(STATE_DIR)
    }

    fn file(&self, name: &str) -> PathBuf {
        self.state_dir().join(name)
    }

    /// Load the recorded state; a missing file is an empty state
    pub async fn load(&self) -> Result<GlobalState> {
        let content = match fs::read_to_string(self.file(STATE_FILE)).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::debug!("No state file yet");
                return Ok(GlobalState::new());
            }
            Err(e) => return Err(e.into()),
        };

        let state: GlobalState = serde_json::from_str(&content)?;
        if state.version > STATE_VERSION {
            return Err(CloudError::StateError(format!(
                "state file version {} is newer than supported version {}",
                state.version, STATE_VERSION
            )));
        }

        tracing::debug!("Loaded state with {} resources", state.resources.len());
        Ok(state)
    }

    /// Replace the state file, copying the previous one to `state.json.backup`
    pub async fn save(&self, state: &GlobalState) -> Result<()> {
        fs::create_dir_all(self.state_dir()).await?;

        let path = self.file(STATE_FILE);
        match fs::copy(&path, self.file(STATE_BACKUP)).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let tmp = self.file(STATE_TMP);
        fs::write(&tmp, serde_json::to_string_pretty(state)?).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!("Saved state with {} resources", state.resources.len());
        Ok(())
    }

    /// Take the exclusive state lock. A lock older than one hour is treated
    /// as left behind by a crashed run and replaced once.
    pub async fn acquire_lock(&self) -> Result<StateLock> {
        fs::create_dir_all(self.state_dir()).await?;

        let lock_path = self.file(LOCK_FILE);
        let info = LockInfo::current();
        let content = serde_json::to_string_pretty(&info)?;

        match create_exclusive(&lock_path, &content).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = read_lock(&lock_path).await?;
                let age = Utc::now().signed_duration_since(holder.acquired_at);
                if age.num_hours() < LOCK_STALE_HOURS {
                    return Err(holder.conflict());
                }

                tracing::warn!(
                    "Replacing stale state lock held by {} (pid {}) since {}",
                    holder.holder,
                    holder.pid,
                    holder.acquired_at
                );
                match fs::remove_file(&lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                match create_exclusive(&lock_path, &content).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                        return Err(CloudError::LockError(
                            "another run took the state lock".to_string(),
                        ));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!("Acquired state lock (pid {})", info.pid);
        Ok(StateLock {
            lock_path,
            released: false,
        })
    }
}

/// Create `path` only if it does not exist yet, then write `content`
async fn create_exclusive(path: &Path, content: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await
}

async fn read_lock(path: &Path) -> Result<LockInfo> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(CloudError::LockError(
                "state lock changed hands while being read".to_string(),
            ));
        }
        Err(e) => return Err(e.into()),
    };
    // An empty or partial file belongs to a run that is still writing it
    serde_json::from_str(&content).map_err(|_| {
        CloudError::LockError("state lock is being acquired by another run".to_string())
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            holder: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    fn conflict(&self) -> CloudError {
        CloudError::LockError(format!(
            "state is locked by {} (pid {}) since {}",
            self.holder, self.pid, self.acquired_at
        ))
    }
}

/// Held state lock; removed on [`StateLock::release`] or drop
#[derive(Debug)]
pub struct StateLock {
    lock_path: PathBuf,
    released: bool,
}

impl StateLock {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => {
                tracing::debug!("Released state lock");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(s: &str) -> ResourceKey {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let mut state = GlobalState::new();
        state.set_resource(
            &key("aws/vpc/main"),
            ResourceState::from_observed(
                &key("aws/vpc/main"),
                &serde_json::json!({"id": "vpc-0abc", "cidr": "10.0.0.0/16"}),
                Some(StatusToken::new("ACTIVE")),
            ),
        );

        manager.save(&state).await.unwrap();

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.resources.len(), 1);
        let vpc = loaded.get_resource(&key("aws/vpc/main")).unwrap();
        assert_eq!(vpc.id, "vpc-0abc");
        assert_eq!(vpc.status.as_ref().unwrap(), "ACTIVE");
        assert_eq!(vpc.attributes["cidr"], "10.0.0.0/16");
        assert!(!manager.state_dir().join(STATE_TMP).exists());
    }

    #[tokio::test]
    async fn test_empty_state() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let state = manager.load().await.unwrap();
        assert!(state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_save_keeps_backup() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let mut state = GlobalState::new();
        manager.save(&state).await.unwrap();
        state.set_resource(&key("aws/vpc/main"), ResourceState::new("vpc-1", "vpc"));
        manager.save(&state).await.unwrap();

        let backup = manager.state_dir().join(STATE_BACKUP);
        assert!(backup.exists());
        let previous: GlobalState =
            serde_json::from_str(&std::fs::read_to_string(backup).unwrap()).unwrap();
        assert!(previous.resources.is_empty());
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let mut state = GlobalState::new();
        state.version = STATE_VERSION + 1;
        manager.save(&state).await.unwrap();

        assert!(matches!(manager.load().await, Err(CloudError::StateError(_))));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());

        let lock = manager.acquire_lock().await.unwrap();
        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));

        lock.release().await.unwrap();
        let again = manager.acquire_lock().await.unwrap();
        drop(again);
        assert!(!manager.state_dir().join(LOCK_FILE).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_admits_one() {
        for _ in 0..20 {
            let temp_dir = tempdir().unwrap();
            let attempts: Vec<_> = (0..8)
                .map(|_| {
                    let manager = StateManager::new(temp_dir.path());
                    tokio::spawn(async move { manager.acquire_lock().await })
                })
                .collect();

            let mut held = Vec::new();
            for attempt in attempts {
                match attempt.await.unwrap() {
                    Ok(lock) => held.push(lock),
                    Err(CloudError::LockError(_)) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            assert_eq!(held.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_replaced() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());
        std::fs::create_dir_all(manager.state_dir()).unwrap();

        let stale = LockInfo {
            holder: "old-host".to_string(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        let lock_path = manager.state_dir().join(LOCK_FILE);
        std::fs::write(&lock_path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = manager.acquire_lock().await.unwrap();
        let current: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(&lock_path).unwrap()).unwrap();
        assert_eq!(current.pid, std::process::id());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_lock_counts_as_held() {
        let temp_dir = tempdir().unwrap();
        let manager = StateManager::new(temp_dir.path());
        std::fs::create_dir_all(manager.state_dir()).unwrap();
        std::fs::write(manager.state_dir().join(LOCK_FILE), "").unwrap();

        assert!(matches!(
            manager.acquire_lock().await,
            Err(CloudError::LockError(_))
        ));
        assert!(manager.state_dir().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_from_observed() {
        let value = serde_json::json!({"id": "subnet-9", "zone": "us-east-1a"});
        let state = ResourceState::from_observed(
            &key("aws/subnet/a"),
            &value,
            Some(StatusToken::new("ACTIVE")),
        );
        assert_eq!(state.id, "subnet-9");
        assert_eq!(state.resource_type, "subnet");
        assert_eq!(state.attributes["zone"], "us-east-1a");

        let fallback =
            ResourceState::from_observed(&key("aws/subnet/b"), &serde_json::Value::Null, None);
        assert_eq!(fallback.id, "b");
        assert!(fallback.attributes.is_empty());
    }

    #[test]
    fn test_provider_filter() {
        let mut state = GlobalState::new();
        state.set_resource(&key("aws/vpc/main"), ResourceState::new("vpc-1", "vpc"));
        state.set_resource(&key("azure/vnet/main"), ResourceState::new("vn-1", "vnet"));
        state.set_resource(&key("aws-gov/vpc/main"), ResourceState::new("vpc-2", "vpc"));

        let aws: Vec<&str> = state.provider_resources("aws").map(|(k, _)| k).collect();
        assert_eq!(aws, vec!["aws/vpc/main"]);
        assert!(state.remove_resource(&key("azure/vnet/main")).is_some());
        assert!(state.remove_resource(&key("azure/vnet/main")).is_none());
    }
}
