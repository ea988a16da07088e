//! In-process collaborators for the active-message fabric.
//!
//! A [`Cluster`] hosts N ranks inside one process: each rank gets a
//! [`LoopbackTransport`] draining a shared inbox from its scheduler's idle
//! loop, and a [`SharedTd`] view onto one cluster-wide termination detector.
//! Region handles move from sender to receiver without copying, so the
//! shared-lease ownership model is exercised end to end.
//!
//! This is the harness the scenario suites run on; production deployments
//! supply their own transport and detector.

pub mod cluster;
pub mod td;

pub use cluster::{Cluster, ClusterBuilder, LoopbackTransport};
pub use td::{ReduceOp, SharedTd, SharedTdGroup};
