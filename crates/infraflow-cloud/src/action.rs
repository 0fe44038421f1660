//! Declarative operations and dependency-ordered plans

use crate::error::{CloudError, Result};
use crate::key::{ResourceKey, StatusToken};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Type of action to perform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Create a new resource
    #[default]
    Create,
    /// Update an existing resource
    Update,
    /// Delete a resource
    Delete,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionType::Create => write!(f, "create"),
            ActionType::Update => write!(f, "update"),
            ActionType::Delete => write!(f, "delete"),
        }
    }
}

/// Per-operation overrides of the default poll profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<StatusToken>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<Vec<StatusToken>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Vec<StatusToken>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// One desired change to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Resource the operation targets
    pub key: ResourceKey,

    /// Type of action to perform
    #[serde(default)]
    pub action: ActionType,

    /// Operations that must converge before this one is dispatched
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<ResourceKey>,

    /// Backend-specific resource configuration
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,

    /// Quota units this resource consumes
    #[serde(default = "default_units")]
    pub units: u64,

    #[serde(default, skip_serializing_if = "is_default_overrides")]
    pub poll: PollOverrides,
}

fn default_units() -> u64 {
    1
}

fn is_default_overrides(poll: &PollOverrides) -> bool {
    *poll == PollOverrides::default()
}

impl Operation {
    pub fn new(key: ResourceKey, action: ActionType) -> Self {
        Self {
            key,
            action,
            depends_on: Vec::new(),
            spec: serde_json::Value::Null,
            units: default_units(),
            poll: PollOverrides::default(),
        }
    }

    pub fn create(key: ResourceKey) -> Self {
        Self::new(key, ActionType::Create)
    }

    pub fn update(key: ResourceKey) -> Self {
        Self::new(key, ActionType::Update)
    }

    pub fn delete(key: ResourceKey) -> Self {
        Self::new(key, ActionType::Delete)
    }

    pub fn depends_on(mut self, key: ResourceKey) -> Self {
        self.depends_on.push(key);
        self
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_units(mut self, units: u64) -> Self {
        self.units = units;
        self
    }

    pub fn with_poll(mut self, poll: PollOverrides) -> Self {
        self.poll = poll;
        self
    }
}

/// Plan containing all operations of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Operations in declaration order
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Plan {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { operations }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Operation> {
        self.operations.iter().find(|op| &op.key == key)
    }

    /// Get operations by type
    pub fn operations_by_type(&self, action: ActionType) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| op.action == action)
            .collect()
    }

    /// Summary of the plan
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            create: self.operations_by_type(ActionType::Create).len(),
            update: self.operations_by_type(ActionType::Update).len(),
            delete: self.operations_by_type(ActionType::Delete).len(),
        }
    }

    /// Reject duplicate keys, dangling dependencies and cycles
    pub fn validate(&self) -> Result<()> {
        self.layers().map(|_| ())
    }

    /// Groups keys into dispatch layers: every key in layer `n` depends only
    /// on keys in layers `< n`. Fails on anything `validate` rejects.
    pub fn layers(&self) -> Result<Vec<Vec<ResourceKey>>> {
        let mut seen = HashSet::new();
        for op in &self.operations {
            if !seen.insert(&op.key) {
                return Err(CloudError::InvalidPlan(format!(
                    "duplicate operation for {}",
                    op.key
                )));
            }
        }

        let mut pending: HashMap<&ResourceKey, usize> = HashMap::new();
        for op in &self.operations {
            let mut deps = HashSet::new();
            for dep in &op.depends_on {
                if dep == &op.key {
                    return Err(CloudError::InvalidPlan(format!(
                        "{} depends on itself",
                        op.key
                    )));
                }
                if !seen.contains(dep) {
                    return Err(CloudError::InvalidPlan(format!(
                        "{} depends on unknown resource {}",
                        op.key, dep
                    )));
                }
                deps.insert(dep);
            }
            pending.insert(&op.key, deps.len());
        }

        let dependents = self.dependents();
        let mut current: Vec<&ResourceKey> = self
            .operations
            .iter()
            .filter(|op| pending[&op.key] == 0)
            .map(|op| &op.key)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for key in &current {
                for dependent in dependents.get(*key).into_iter().flatten() {
                    if let Some(count) = pending.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            next.push(*dependent);
                        }
                    }
                }
            }
            layers.push(current.into_iter().cloned().collect());
            current = next;
        }

        if placed != self.operations.len() {
            let mut stuck: Vec<String> = pending
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(key, _)| key.to_string())
                .collect();
            stuck.sort();
            return Err(CloudError::InvalidPlan(format!(
                "dependency cycle among: {}",
                stuck.join(", ")
            )));
        }

        Ok(layers)
    }

    /// Map from a key to the keys that directly depend on it, in plan order
    pub fn dependents(&self) -> HashMap<&ResourceKey, Vec<&ResourceKey>> {
        let mut map: HashMap<&ResourceKey, Vec<&ResourceKey>> = HashMap::new();
        for op in &self.operations {
            let mut unique = HashSet::new();
            for dep in &op.depends_on {
                if unique.insert(dep) {
                    map.entry(dep).or_default().push(&op.key);
                }
            }
        }
        map
    }

    /// Every key reachable from `root` through dependent edges
    pub fn transitive_dependents(&self, root: &ResourceKey) -> Vec<ResourceKey> {
        let dependents = self.dependents();
        let mut visited: HashSet<&ResourceKey> = HashSet::new();
        let mut queue: VecDeque<&ResourceKey> = VecDeque::from([root]);
        let mut out = Vec::new();

        while let Some(key) = queue.pop_front() {
            for dependent in dependents.get(key).into_iter().flatten() {
                if visited.insert(*dependent) {
                    out.push((*dependent).clone());
                    queue.push_back(*dependent);
                }
            }
        }
        out
    }

    /// Teardown plan for this plan: every operation becomes a delete and
    /// every dependency edge is inverted, so dependents go first.
    pub fn reversed(&self) -> Plan {
        let mut inverted: HashMap<&ResourceKey, Vec<ResourceKey>> = HashMap::new();
        for op in &self.operations {
            for dep in &op.depends_on {
                inverted.entry(dep).or_default().push(op.key.clone());
            }
        }

        let operations = self
            .operations
            .iter()
            .rev()
            .map(|op| Operation {
                key: op.key.clone(),
                action: ActionType::Delete,
                depends_on: inverted.remove(&op.key).unwrap_or_default(),
                spec: op.spec.clone(),
                units: op.units,
                poll: PollOverrides {
                    timeout_secs: op.poll.timeout_secs,
                    ..PollOverrides::default()
                },
            })
            .collect();

        Plan { operations }
    }
}

/// Summary of planned operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete",
            self.create, self.update, self.delete
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        s.parse().unwrap()
    }

    fn network_plan() -> Plan {
        Plan::new(vec![
            Operation::create(key("aws/vpc/main")),
            Operation::create(key("aws/subnet/a")).depends_on(key("aws/vpc/main")),
            Operation::create(key("aws/subnet/b")).depends_on(key("aws/vpc/main")),
            Operation::create(key("aws/instance/bootstrap"))
                .depends_on(key("aws/subnet/a"))
                .depends_on(key("aws/subnet/b")),
        ])
    }

    #[test]
    fn test_layers_follow_dependencies() {
        let layers = network_plan().layers().unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(layers[0], vec![key("aws/vpc/main")]);
        assert_eq!(layers[1], vec![key("aws/subnet/a"), key("aws/subnet/b")]);
        assert_eq!(layers[2], vec![key("aws/instance/bootstrap")]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let plan = Plan::new(vec![
            Operation::create(key("aws/vpc/main")),
            Operation::update(key("aws/vpc/main")),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate operation for aws/vpc/main"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let plan = Plan::new(vec![
            Operation::create(key("aws/subnet/a")).depends_on(key("aws/vpc/missing")),
        ]);
        assert!(matches!(plan.validate(), Err(CloudError::InvalidPlan(_))));
    }

    #[test]
    fn test_cycle_rejected() {
        let plan = Plan::new(vec![
            Operation::create(key("aws/a/x")).depends_on(key("aws/b/y")),
            Operation::create(key("aws/b/y")).depends_on(key("aws/a/x")),
            Operation::create(key("aws/c/z")),
        ]);
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("dependency cycle among: aws/a/x, aws/b/y"));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let plan = Plan::new(vec![
            Operation::create(key("aws/vpc/main")),
            Operation::create(key("aws/subnet/a"))
                .depends_on(key("aws/vpc/main"))
                .depends_on(key("aws/vpc/main")),
        ]);
        assert_eq!(plan.layers().unwrap().len(), 2);
    }

    #[test]
    fn test_transitive_dependents() {
        let plan = network_plan();
        let mut deps = plan.transitive_dependents(&key("aws/vpc/main"));
        deps.sort();
        assert_eq!(
            deps,
            vec![
                key("aws/instance/bootstrap"),
                key("aws/subnet/a"),
                key("aws/subnet/b"),
            ]
        );
        assert!(plan.transitive_dependents(&key("aws/instance/bootstrap")).is_empty());
    }

    #[test]
    fn test_reversed_plan_inverts_edges() {
        let reversed = network_plan().reversed();
        assert!(reversed.operations.iter().all(|op| op.action == ActionType::Delete));

        let vpc = reversed.get(&key("aws/vpc/main")).unwrap();
        assert_eq!(vpc.depends_on, vec![key("aws/subnet/a"), key("aws/subnet/b")]);

        let layers = reversed.layers().unwrap();
        assert_eq!(layers[0], vec![key("aws/instance/bootstrap")]);
        assert_eq!(layers.last().unwrap(), &vec![key("aws/vpc/main")]);
    }

    #[test]
    fn test_summary() {
        let mut plan = network_plan();
        plan.push(Operation::delete(key("aws/eip/old")));
        assert_eq!(
            plan.summary().to_string(),
            "4 to create, 0 to update, 1 to delete"
        );
    }

    #[test]
    fn test_operation_defaults_from_json() {
        let op: Operation = serde_json::from_value(serde_json::json!({
            "key": "aws/vpc/main",
        }))
        .unwrap();
        assert_eq!(op.action, ActionType::Create);
        assert_eq!(op.units, 1);
        assert!(op.depends_on.is_empty());
        assert!(op.spec.is_null());
    }
}
