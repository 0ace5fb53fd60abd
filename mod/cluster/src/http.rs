//! Kubernetes REST implementation of [`ClusterApi`].
//!
//! A worker is realised as a batch/v1 Job (one pod, no retries, 15 minute
//! TTL after finish); the termination message is read from the job's pod.
//! Only the handful of fields the control plane needs are deserialised.

use std::collections::BTreeMap;
use std::path::Path;

use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ClusterApi, ClusterError};
use crate::launcher::APP_LABEL;
use crate::model::{Node, NodeCondition, Worker, WorkerEvent, WorkerPhase, WorkerSpec};

const SERVICEACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Kubernetes REST client scoped to one namespace.
pub struct HttpCluster {
    client: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
}

impl HttpCluster {
    /// Build a client from the in-cluster service account environment
    /// (`KUBERNETES_SERVICE_HOST`/`_PORT`, mounted token and CA).
    pub fn in_cluster(namespace: &str) -> Result<Self, ClusterError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ClusterError::Api("KUBERNETES_SERVICE_HOST not set".into()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());

        let sa_dir = Path::new(SERVICEACCOUNT_DIR);
        let token = std::fs::read_to_string(sa_dir.join("token"))
            .map_err(|e| ClusterError::Api(format!("read service account token: {e}")))?;
        let ca_pem = std::fs::read(sa_dir.join("ca.crt"))
            .map_err(|e| ClusterError::Api(format!("read service account CA: {e}")))?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)
            .map_err(|e| ClusterError::Api(format!("parse service account CA: {e}")))?;

        // Fall back to the mounted namespace when the caller passed none.
        let namespace = if namespace.is_empty() {
            std::fs::read_to_string(sa_dir.join("namespace"))
                .map(|ns| ns.trim().to_string())
                .unwrap_or_else(|_| "default".into())
        } else {
            namespace.to_string()
        };

        let client = reqwest::Client::builder()
            .add_root_certificate(ca)
            .build()
            .map_err(|e| ClusterError::Api(format!("build http client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("https://{host}:{port}"),
            token: token.trim().to_string(),
            namespace,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClusterError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ClusterError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ClusterError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClusterError::NotFound(format!("api returned {status}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ClusterError::Api(format!("api returned {status}: {body}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ClusterError::Api(format!("decode response: {e}")))
    }

    fn job_body(&self, spec: &WorkerSpec) -> serde_json::Value {
        let mut env = vec![
            json!({"name": "IMAGES", "value": spec.images.join(",")}),
            json!({"name": "CRI_SOCKET_PATH", "value": spec.cri_socket_path}),
        ];
        // Credentials come through the bundle secret so the plain value
        // never appears in the pod spec.
        if let Some(secret) = &spec.cred_secret {
            env.push(json!({
                "name": "REGISTRY_CREDS",
                "valueFrom": {"secretKeyRef": {"name": secret, "key": "credentials"}},
            }));
        }

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": spec.name,
                "namespace": self.namespace,
                "labels": {
                    "app": APP_LABEL,
                    "task-id": spec.task_id,
                    "node": spec.node,
                },
            },
            "spec": {
                "ttlSecondsAfterFinished": spec.ttl_seconds,
                "backoffLimit": 0,
                "template": {
                    "metadata": {
                        "labels": {"app": APP_LABEL, "task-id": spec.task_id},
                    },
                    "spec": {
                        "restartPolicy": "Never",
                        "hostNetwork": true,
                        "nodeSelector": {"kubernetes.io/hostname": spec.node},
                        "tolerations": [{"operator": "Exists"}],
                        "containers": [{
                            "name": "puller",
                            "image": spec.puller_image,
                            "imagePullPolicy": "Always",
                            "command": ["/app/prewarmd"],
                            "args": ["pull"],
                            "env": env,
                            "volumeMounts": [{
                                "name": "cri-socket",
                                "mountPath": spec.cri_socket_path,
                            }],
                            "securityContext": {
                                "privileged": true,
                                "runAsUser": 0,
                                "runAsGroup": 0,
                            },
                        }],
                        "volumes": [{
                            "name": "cri-socket",
                            "hostPath": {"path": spec.cri_socket_path},
                        }],
                    },
                },
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Wire types (the slices of the Kubernetes API we read)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct KubeList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct KubeMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct KubeNode {
    metadata: KubeMeta,
    #[serde(default)]
    spec: KubeNodeSpec,
    #[serde(default)]
    status: KubeNodeStatus,
}

#[derive(Deserialize, Default)]
struct KubeNodeSpec {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Deserialize, Default)]
struct KubeNodeStatus {
    #[serde(default)]
    conditions: Vec<KubeCondition>,
}

#[derive(Deserialize)]
struct KubeCondition {
    #[serde(rename = "type", default)]
    condition_type: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct KubeJob {
    metadata: KubeMeta,
    #[serde(default)]
    status: KubeJobStatus,
}

#[derive(Deserialize, Default)]
struct KubeJobStatus {
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<KubeCondition>,
}

#[derive(Deserialize)]
struct KubePod {
    #[serde(default)]
    status: KubePodStatus,
}

#[derive(Deserialize, Default)]
struct KubePodStatus {
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<KubeContainerStatus>,
}

#[derive(Deserialize)]
struct KubeContainerStatus {
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: KubeContainerState,
}

#[derive(Deserialize, Default)]
struct KubeContainerState {
    terminated: Option<KubeTerminated>,
}

#[derive(Deserialize)]
struct KubeTerminated {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct KubeWatchEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    object: KubeJob,
}

#[derive(Deserialize)]
struct KubeTokenReview {
    #[serde(default)]
    status: KubeTokenReviewStatus,
}

#[derive(Deserialize, Default)]
struct KubeTokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: KubeTokenUser,
}

#[derive(Deserialize, Default)]
struct KubeTokenUser {
    #[serde(default)]
    username: String,
}

fn worker_from_job(job: KubeJob) -> Worker {
    let phase = if job.status.succeeded > 0 {
        WorkerPhase::Succeeded
    } else if job.status.failed > 0 {
        WorkerPhase::Failed
    } else {
        WorkerPhase::Running
    };
    let message = job
        .status
        .conditions
        .last()
        .map(|c| c.message.clone())
        .filter(|m| !m.is_empty());
    Worker {
        name: job.metadata.name,
        task_id: job
            .metadata
            .labels
            .get("task-id")
            .cloned()
            .unwrap_or_default(),
        node: job.metadata.labels.get("node").cloned().unwrap_or_default(),
        phase,
        message,
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl ClusterApi for HttpCluster {
    async fn list_nodes(
        &self,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Node>, ClusterError> {
        let mut path = "/api/v1/nodes".to_string();
        if !selector.is_empty() {
            path = format!("{path}?labelSelector={}", selector_string(selector));
        }
        let list: KubeList<KubeNode> = self.get_json(&path).await?;
        Ok(list
            .items
            .into_iter()
            .map(|n| Node {
                name: n.metadata.name,
                labels: n.metadata.labels,
                conditions: n
                    .status
                    .conditions
                    .into_iter()
                    .map(|c| NodeCondition {
                        condition_type: c.condition_type,
                        status: c.status,
                    })
                    .collect(),
                unschedulable: n.spec.unschedulable,
            })
            .collect())
    }

    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), ClusterError> {
        let path = format!("/apis/batch/v1/namespaces/{}/jobs", self.namespace);
        let _: serde_json::Value = self.post_json(&path, &self.job_body(spec)).await?;
        Ok(())
    }

    async fn delete_worker(&self, name: &str) -> Result<(), ClusterError> {
        let path = format!(
            "/apis/batch/v1/namespaces/{}/jobs/{name}?propagationPolicy=Background",
            self.namespace
        );
        let resp = self
            .client
            .delete(self.url(&path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        let _: serde_json::Value = Self::decode(resp).await?;
        Ok(())
    }

    async fn list_workers(&self, task_id: &str) -> Result<Vec<Worker>, ClusterError> {
        let path = format!(
            "/apis/batch/v1/namespaces/{}/jobs?labelSelector=task-id%3D{task_id}",
            self.namespace
        );
        let list: KubeList<KubeJob> = self.get_json(&path).await?;
        Ok(list.items.into_iter().map(worker_from_job).collect())
    }

    async fn read_worker_result(&self, worker_name: &str) -> Result<Option<String>, ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/pods?labelSelector=job-name%3D{worker_name}",
            self.namespace
        );
        let pods: KubeList<KubePod> = self.get_json(&path).await?;
        for pod in pods.items {
            for cs in pod.status.container_statuses {
                if cs.name != "puller" {
                    continue;
                }
                if let Some(terminated) = cs.state.terminated {
                    if !terminated.message.is_empty() {
                        return Ok(Some(terminated.message));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn watch_workers(
        &self,
        task_id: &str,
    ) -> Result<mpsc::Receiver<WorkerEvent>, ClusterError> {
        let path = format!(
            "/apis/batch/v1/namespaces/{}/jobs?watch=true&labelSelector=task-id%3D{task_id}",
            self.namespace
        );
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClusterError::Api(format!(
                "watch returned {}",
                resp.status()
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        let task = task_id.to_string();
        tokio::spawn(async move {
            // The API server frames watch events as one JSON object per line.
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(task_id = %task, error = %e, "worker watch stream error");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line: String = buffer.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let event: KubeWatchEvent = match serde_json::from_str(line) {
                        Ok(e) => e,
                        Err(e) => {
                            debug!(error = %e, "skipping undecodable watch line");
                            continue;
                        }
                    };
                    let worker = worker_from_job(event.object);
                    let event = match event.event_type.as_str() {
                        "ADDED" => WorkerEvent::Added(worker),
                        "DELETED" => WorkerEvent::Deleted(worker),
                        _ => WorkerEvent::Modified(worker),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            // Channel drops here; the tracker sees the close and falls back.
        });

        Ok(rx)
    }

    async fn create_secret(
        &self,
        name: &str,
        task_id: &str,
        credentials: &str,
    ) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{}/secrets", self.namespace);
        let body = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": {"app": APP_LABEL, "task-id": task_id},
            },
            "type": "Opaque",
            "stringData": {"credentials": credentials},
        });
        let _: serde_json::Value = self.post_json(&path, &body).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ClusterError> {
        let path = format!("/api/v1/namespaces/{}/secrets/{name}", self.namespace);
        let resp = self
            .client
            .delete(self.url(&path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ClusterError::Api(e.to_string()))?;
        match Self::decode::<serde_json::Value>(resp).await {
            Ok(_) => Ok(()),
            // Deleting an already-gone bundle is fine.
            Err(ClusterError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_secrets(&self) -> Result<Vec<(String, String)>, ClusterError> {
        let path = format!(
            "/api/v1/namespaces/{}/secrets?labelSelector=app%3D{APP_LABEL}",
            self.namespace
        );
        #[derive(Deserialize)]
        struct KubeSecret {
            metadata: KubeMeta,
        }
        let list: KubeList<KubeSecret> = self.get_json(&path).await?;
        Ok(list
            .items
            .into_iter()
            .map(|s| {
                let task_id = s
                    .metadata
                    .labels
                    .get("task-id")
                    .cloned()
                    .unwrap_or_default();
                (s.metadata.name, task_id)
            })
            .collect())
    }

    async fn review_token(&self, token: &str) -> Result<Option<String>, ClusterError> {
        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": {"token": token},
        });
        let review: KubeTokenReview = self
            .post_json("/apis/authentication.k8s.io/v1/tokenreviews", &body)
            .await?;
        if review.status.authenticated {
            Ok(Some(review.status.user.username))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_maps_to_phase() {
        let job: KubeJob = serde_json::from_value(json!({
            "metadata": {"name": "prewarm-t-n", "labels": {"task-id": "t", "node": "n"}},
            "status": {"succeeded": 1},
        }))
        .unwrap();
        let worker = worker_from_job(job);
        assert_eq!(worker.phase, WorkerPhase::Succeeded);
        assert_eq!(worker.task_id, "t");
        assert_eq!(worker.node, "n");

        let job: KubeJob = serde_json::from_value(json!({
            "metadata": {"name": "prewarm-t-n", "labels": {"task-id": "t", "node": "n"}},
            "status": {"failed": 1, "conditions": [
                {"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"},
            ]},
        }))
        .unwrap();
        let worker = worker_from_job(job);
        assert_eq!(worker.phase, WorkerPhase::Failed);
        assert_eq!(worker.message.as_deref(), Some("BackoffLimitExceeded"));

        let job: KubeJob = serde_json::from_value(json!({
            "metadata": {"name": "prewarm-t-n", "labels": {"task-id": "t", "node": "n"}},
            "status": {},
        }))
        .unwrap();
        assert_eq!(worker_from_job(job).phase, WorkerPhase::Running);
    }

    #[test]
    fn selector_join() {
        let mut selector = BTreeMap::new();
        selector.insert("a".to_string(), "1".to_string());
        selector.insert("b".to_string(), "2".to_string());
        assert_eq!(selector_string(&selector), "a=1,b=2");
    }

    #[test]
    fn watch_event_decodes() {
        let event: KubeWatchEvent = serde_json::from_str(
            r#"{"type":"MODIFIED","object":{"metadata":{"name":"prewarm-t-n","labels":{"task-id":"t","node":"n"}},"status":{"succeeded":1}}}"#,
        )
        .unwrap();
        assert_eq!(event.event_type, "MODIFIED");
        assert_eq!(worker_from_job(event.object).phase, WorkerPhase::Succeeded);
    }
}
