use async_trait::async_trait;
use infraflow_cloud::{
    ActionType, Backend, Backoff, CloudError, Observed, Operation, PollProfile, ResourceKey,
    Result,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum Reply {
    Status(&'static str),
    Absent,
    Error(&'static str),
}

#[derive(Default)]
struct Resource {
    existing: Option<&'static str>,
    submitted: bool,
    script: VecDeque<Reply>,
}

/// In-memory backend replaying scripted describe replies.
///
/// Before a resource is submitted, describe reports its pre-existing status
/// (absent by default). After submit, replies come from the script; the
/// last reply repeats.
pub struct FakeBackend {
    name: String,
    resources: Mutex<HashMap<ResourceKey, Resource>>,
    failing_submits: Mutex<HashSet<ResourceKey>>,
    hanging_submits: Mutex<HashSet<ResourceKey>>,
    log: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FakeBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resources: Mutex::new(HashMap::new()),
            failing_submits: Mutex::new(HashSet::new()),
            hanging_submits: Mutex::new(HashSet::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, key: &ResourceKey, replies: Vec<Reply>) -> Self {
        self.resources
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .script = replies.into();
        self
    }

    pub fn existing(self, key: &ResourceKey, status: &'static str) -> Self {
        self.resources
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .existing = Some(status);
        self
    }

    pub fn failing_submit(self, key: &ResourceKey) -> Self {
        self.failing_submits.lock().unwrap().insert(key.clone());
        self
    }

    /// Submit for `key` never returns
    pub fn hanging_submit(self, key: &ResourceKey) -> Self {
        self.hanging_submits.lock().unwrap().insert(key.clone());
        self
    }

    /// Every call in order, as `describe:<key>` / `submit:<action>:<key>`
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &ResourceKey) -> usize {
        let suffix = format!(":{}", key);
        self.log().iter().filter(|l| l.ends_with(&suffix)).count()
    }

    pub fn submits(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|l| l.starts_with("submit:"))
            .collect()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log().iter().position(|l| l == entry)
    }

    pub fn last_position(&self, entry: &str) -> Option<usize> {
        self.log().iter().rposition(|l| l == entry)
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn describe(&self, key: &ResourceKey) -> Result<Observed> {
        self.log.lock().unwrap().push(format!("describe:{}", key));

        let reply = {
            let mut resources = self.resources.lock().unwrap();
            let resource = resources.entry(key.clone()).or_default();
            if !resource.submitted {
                resource
                    .existing
                    .map(Reply::Status)
                    .unwrap_or(Reply::Absent)
            } else if resource.script.len() > 1 {
                resource.script.pop_front().unwrap()
            } else {
                resource.script.front().cloned().unwrap_or(Reply::Absent)
            }
        };

        match reply {
            Reply::Status(status) => Ok(Observed::new(
                status,
                serde_json::json!({ "id": format!("{}-id", key.name), "status": status }),
            )),
            Reply::Absent => Err(CloudError::ResourceNotFound(key.to_string())),
            Reply::Error(msg) => Err(CloudError::ApiError(msg.to_string())),
        }
    }

    async fn submit(&self, operation: &Operation) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("submit:{}:{}", operation.action, operation.key));

        let hangs = self.hanging_submits.lock().unwrap().contains(&operation.key);
        if hangs {
            std::future::pending::<()>().await;
        }
        if self.failing_submits.lock().unwrap().contains(&operation.key) {
            return Err(CloudError::ApiError("quota exceeded".to_string()));
        }
        self.resources
            .lock()
            .unwrap()
            .entry(operation.key.clone())
            .or_default()
            .submitted = true;
        Ok(())
    }
}

pub fn key(s: &str) -> ResourceKey {
    s.parse().unwrap()
}

/// Fixed 10s polling, 5 minute deadline, no not-found tolerance
pub fn test_profile() -> PollProfile {
    PollProfile {
        timeout: Duration::from_secs(300),
        backoff: Backoff::fixed(Duration::from_secs(10)),
        min_interval: Duration::from_secs(1),
        initial_delay: Duration::ZERO,
        not_found_tolerance: 0,
        continuous_target: 1,
    }
}

#[allow(dead_code)]
pub fn create(s: &str) -> Operation {
    Operation::new(key(s), ActionType::Create)
}
