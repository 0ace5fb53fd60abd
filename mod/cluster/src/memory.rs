//! In-memory [`ClusterApi`] implementation.
//!
//! Backs the test suite and socket-less local development. Test hooks
//! drive worker lifecycles (`complete_worker`, `fail_worker`) and watch
//! channels receive the same events the HTTP client would surface.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::api::{ClusterApi, ClusterError};
use crate::model::{Node, NodeCondition, Worker, WorkerEvent, WorkerPhase, WorkerSpec};

#[derive(Default)]
struct State {
    nodes: Vec<Node>,
    workers: HashMap<String, Worker>,
    /// Raw termination messages by worker name.
    results: HashMap<String, String>,
    /// name -> (task id, credentials).
    secrets: HashMap<String, (String, String)>,
    /// token -> username accepted by the fake token review endpoint.
    tokens: HashMap<String, String>,
    /// Nodes on which worker creation fails (to exercise partial batches).
    broken_nodes: Vec<String>,
    /// When true, watch_workers fails so the tracker takes the polling path.
    refuse_watch: bool,
    watchers: Vec<(String, mpsc::Sender<WorkerEvent>)>,
}

pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    // -----------------------------------------------------------------------
    // Fixture hooks
    // -----------------------------------------------------------------------

    /// Add a ready, schedulable node.
    pub fn add_node(&self, name: &str) {
        self.add_node_with(name, BTreeMap::new(), true, true);
    }

    pub fn add_node_with(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        ready: bool,
        schedulable: bool,
    ) {
        let node = Node {
            name: name.to_string(),
            labels,
            conditions: vec![NodeCondition {
                condition_type: "Ready".into(),
                status: if ready { "True".into() } else { "False".into() },
            }],
            unschedulable: !schedulable,
        };
        self.state.lock().unwrap().nodes.push(node);
    }

    /// Make worker creation fail on the given node.
    pub fn break_node(&self, name: &str) {
        self.state.lock().unwrap().broken_nodes.push(name.to_string());
    }

    /// Force the tracker onto its polling fallback.
    pub fn refuse_watch(&self) {
        self.state.lock().unwrap().refuse_watch = true;
    }

    /// Accept `token` as a cluster-issued identity for `username`.
    pub fn accept_token(&self, token: &str, username: &str) {
        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(token.to_string(), username.to_string());
    }

    /// Drive a running worker to Succeeded with the given termination message.
    pub fn complete_worker(&self, name: &str, termination_message: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(name) {
            worker.phase = WorkerPhase::Succeeded;
            let snapshot = worker.clone();
            state
                .results
                .insert(name.to_string(), termination_message.to_string());
            notify(&mut state, WorkerEvent::Modified(snapshot));
        }
    }

    /// Drive a running worker to Failed with the given condition message.
    pub fn fail_worker(&self, name: &str, message: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(worker) = state.workers.get_mut(name) {
            worker.phase = WorkerPhase::Failed;
            worker.message = Some(message.to_string());
            let snapshot = worker.clone();
            notify(&mut state, WorkerEvent::Modified(snapshot));
        }
    }

    /// Complete every running worker of a task with one shared message.
    pub fn complete_all(&self, task_id: &str, termination_message: &str) {
        let names: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .workers
                .values()
                .filter(|w| w.task_id == task_id && w.phase == WorkerPhase::Running)
                .map(|w| w.name.clone())
                .collect()
        };
        for name in names {
            self.complete_worker(&name, termination_message);
        }
    }

    pub fn worker_names(&self, task_id: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.task_id == task_id)
            .map(|w| w.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn secret_value(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(name)
            .map(|(_, credentials)| credentials.clone())
    }
}

/// Push an event to every watcher registered for the worker's task.
/// Full channels are skipped: events are reconcile hints, not state.
fn notify(state: &mut State, event: WorkerEvent) {
    let task_id = match &event {
        WorkerEvent::Added(w) | WorkerEvent::Modified(w) | WorkerEvent::Deleted(w) => {
            w.task_id.clone()
        }
    };
    state.watchers.retain(|(watched, tx)| {
        if *watched != task_id {
            return !tx.is_closed();
        }
        let _ = tx.try_send(event.clone());
        !tx.is_closed()
    });
}

#[async_trait::async_trait]
impl ClusterApi for MemoryCluster {
    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Node>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .nodes
            .iter()
            .filter(|n| n.matches_selector(selector))
            .cloned()
            .collect())
    }

    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.broken_nodes.contains(&spec.node) {
            return Err(ClusterError::Api(format!(
                "admission refused on node {}",
                spec.node
            )));
        }
        if state.workers.contains_key(&spec.name) {
            return Err(ClusterError::Api(format!(
                "worker {} already exists",
                spec.name
            )));
        }
        let worker = Worker {
            name: spec.name.clone(),
            task_id: spec.task_id.clone(),
            node: spec.node.clone(),
            phase: WorkerPhase::Running,
            message: None,
        };
        state.workers.insert(spec.name.clone(), worker.clone());
        notify(&mut state, WorkerEvent::Added(worker));
        Ok(())
    }

    async fn delete_worker(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        match state.workers.remove(name) {
            Some(worker) => {
                state.results.remove(name);
                notify(&mut state, WorkerEvent::Deleted(worker));
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!("worker {name}"))),
        }
    }

    async fn list_workers(&self, task_id: &str) -> Result<Vec<Worker>, ClusterError> {
        let state = self.state.lock().unwrap();
        let mut workers: Vec<Worker> = state
            .workers
            .values()
            .filter(|w| w.task_id == task_id)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workers)
    }

    async fn read_worker_result(&self, worker_name: &str) -> Result<Option<String>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.results.get(worker_name).cloned())
    }

    async fn watch_workers(
        &self,
        task_id: &str,
    ) -> Result<mpsc::Receiver<WorkerEvent>, ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_watch {
            return Err(ClusterError::Api("watch not supported".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.watchers.push((task_id.to_string(), tx));
        Ok(rx)
    }

    async fn create_secret(
        &self,
        name: &str,
        task_id: &str,
        credentials: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if state.secrets.contains_key(name) {
            return Err(ClusterError::Api(format!("secret {name} already exists")));
        }
        state.secrets.insert(
            name.to_string(),
            (task_id.to_string(), credentials.to_string()),
        );
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        self.state.lock().unwrap().secrets.remove(name);
        Ok(())
    }

    async fn list_secrets(&self) -> Result<Vec<(String, String)>, ClusterError> {
        let state = self.state.lock().unwrap();
        let mut secrets: Vec<(String, String)> = state
            .secrets
            .iter()
            .map(|(name, (task_id, _))| (name.clone(), task_id.clone()))
            .collect();
        secrets.sort();
        Ok(secrets)
    }

    async fn review_token(&self, token: &str) -> Result<Option<String>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state.tokens.get(token).cloned())
    }
}
