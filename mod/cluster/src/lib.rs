//! Cluster module — the seam between the control plane and the
//! orchestrator API.
//!
//! The core components only ever talk to [`ClusterApi`]; the concrete
//! implementation is injected at startup ([`HttpCluster`] in production,
//! [`MemoryCluster`] in tests and local development).

pub mod api;
pub mod http;
pub mod launcher;
pub mod memory;
pub mod model;

pub use api::{ClusterApi, ClusterError};
pub use http::HttpCluster;
pub use launcher::{LauncherConfig, WorkerLauncher};
pub use memory::MemoryCluster;
pub use model::{
    filter_ready_nodes, Node, NodeCondition, Worker, WorkerEvent, WorkerPhase, WorkerSpec,
};
