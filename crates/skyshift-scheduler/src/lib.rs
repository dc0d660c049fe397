//! The SkyShift scheduling engine
//!
//! An event-driven FIFO scheduler that filters, scores and spreads a
//! job's replicas across READY clusters. Placement is a pure function of
//! the cluster/job snapshot; commits are optimistic and restart the
//! job's iteration on conflict.

pub mod controller;
pub mod placement;
pub mod plugins;
pub mod queue;

pub use controller::{SchedulerConfig, SchedulerController};
pub use placement::{Placer, PlacementOutcome};
pub use plugins::{
    build_plugins, ClusterAffinityPlugin, DefaultPlugin, FilterComposition, ScheduleContext,
    SchedulerPlugin, Verdict,
};
pub use queue::{JobQueue, JobRef};
