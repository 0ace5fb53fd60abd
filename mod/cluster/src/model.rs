use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single condition reported for a node ("Ready", "DiskPressure", ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
}

/// A cluster node, reduced to what scheduling decisions need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub conditions: Vec<NodeCondition>,
    /// True when the node is cordoned.
    #[serde(default)]
    pub unschedulable: bool,
}

impl Node {
    /// Whether the node reports condition "Ready" == "True".
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .find(|c| c.condition_type == "Ready")
            .map(|c| c.status == "True")
            .unwrap_or(false)
    }

    /// Whether the node accepts new pods (not cordoned).
    pub fn is_schedulable(&self) -> bool {
        !self.unschedulable
    }

    /// AND-match against a label selector. An empty selector matches all.
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

/// Names of the nodes that are both ready and schedulable, in input order.
pub fn filter_ready_nodes(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.is_ready() && n.is_schedulable())
        .map(|n| n.name.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Lifecycle phase of a worker, collapsed from the orchestrator's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A per-(task, node) worker as observed through the orchestrator API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub task_id: String,
    pub node: String,
    pub phase: WorkerPhase,
    /// Last condition message, set when the worker failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A change notification from a worker event stream. The tracker treats
/// these purely as "reconcile now" hints and never derives state from the
/// event payload alone.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Added(Worker),
    Modified(Worker),
    Deleted(Worker),
}

/// Everything needed to create one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub task_id: String,
    pub node: String,
    pub images: Vec<String>,
    /// Name of the credential bundle secret, when registry auth is needed.
    pub cred_secret: Option<String>,
    pub puller_image: String,
    pub cri_socket_path: String,
    /// Seconds the finished worker is kept around before auto-expiry.
    pub ttl_seconds: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, ready: bool, unschedulable: bool) -> Node {
        Node {
            name: name.into(),
            labels: BTreeMap::new(),
            conditions: vec![NodeCondition {
                condition_type: "Ready".into(),
                status: if ready { "True".into() } else { "False".into() },
            }],
            unschedulable,
        }
    }

    #[test]
    fn ready_and_schedulable() {
        assert!(node("a", true, false).is_ready());
        assert!(!node("a", false, false).is_ready());
        assert!(node("a", true, false).is_schedulable());
        assert!(!node("a", true, true).is_schedulable());
    }

    #[test]
    fn node_without_ready_condition_is_not_ready() {
        let n = Node {
            name: "bare".into(),
            labels: BTreeMap::new(),
            conditions: vec![],
            unschedulable: false,
        };
        assert!(!n.is_ready());
    }

    #[test]
    fn filter_keeps_input_order() {
        let nodes = vec![
            node("n1", true, false),
            node("n2", false, false),
            node("n3", true, true),
            node("n4", true, false),
        ];
        assert_eq!(filter_ready_nodes(&nodes), vec!["n1", "n4"]);
    }

    #[test]
    fn selector_and_match() {
        let mut n = node("labelled", true, false);
        n.labels.insert("zone".into(), "a".into());
        n.labels.insert("gpu".into(), "true".into());

        let empty = BTreeMap::new();
        assert!(n.matches_selector(&empty));

        let mut one = BTreeMap::new();
        one.insert("zone".into(), "a".into());
        assert!(n.matches_selector(&one));

        let mut both = one.clone();
        both.insert("gpu".into(), "true".into());
        assert!(n.matches_selector(&both));

        let mut wrong = one.clone();
        wrong.insert("gpu".into(), "false".into());
        assert!(!n.matches_selector(&wrong));
    }
}
