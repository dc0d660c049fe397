//! Skylets: per-cluster reconcilers for SkyShift
//!
//! A skylet hosts the cluster, job, flow, service, endpoints and network
//! controllers for one registered cluster, all speaking to the backend
//! through a single compatibility-layer handle. The [`SkyletManager`]
//! creates and tears down skylets as Cluster objects come and go.

pub mod cluster_controller;
pub mod endpoints_controller;
pub mod flow_controller;
pub mod job_controller;
pub mod network_controller;
pub mod service_controller;
pub mod skylet;
pub mod skylet_manager;
pub mod util;

pub use cluster_controller::ClusterController;
pub use endpoints_controller::EndpointsController;
pub use flow_controller::FlowController;
pub use job_controller::JobController;
pub use network_controller::NetworkController;
pub use service_controller::ServiceController;
pub use skylet::{run_skylet, SkyletConfig};
pub use skylet_manager::{purge_cluster_slices, SkyletManager};
