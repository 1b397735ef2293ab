//! FleetNode Compute
//!
//! Provider-independent engine for driving cloud nodes and their supporting
//! resources to a desired state, on APIs that are asynchronous and only
//! eventually consistent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                  FleetNode CLI                   │
//! │            (fleetnode up/down/wait)              │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │               fleetnode-compute                  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │              ComputeService               │   │
//! │  └──────────────────────────────────────────┘   │
//! │  ┌──────────────┐ ┌─────────────┐ ┌──────────┐  │
//! │  │ Convergence  │ │ Keyed cache │ │ Orphan   │  │
//! │  │ loop         │ │ + creator   │ │ cleanup  │  │
//! │  └──────────────┘ └─────────────┘ └──────────┘  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait ComputeProvider { ... }            │   │
//! │  └──────────────────────────────────────────┘   │
//! └───────┬─────────────────────────────────────────┘
//!         │
//! ┌───────▼───────┐
//! │ sakura-cloud  │
//! │   provider    │
//! └───────────────┘
//! ```

pub mod cache;
pub mod convergence;
pub mod creator;
pub mod error;
pub mod naming;
pub mod node;
pub mod predicate;
pub mod provider;
pub mod reconcile;
pub mod resource;
pub mod service;

// Re-exports
pub use cache::{CacheEntry, KeyedResourceCache};
pub use convergence::{ConvergenceLoop, Outcome, PollConfig};
pub use creator::{ConflictRetryingCreator, Resolution, RetryConfig};
pub use error::{ComputeError, ReconcileFailure, ReconcileFailures, Result, RunNodesFailure};
pub use naming::{GroupNamingConvention, GroupOf};
pub use node::{NodeMetadata, NodeSpec, NodeTemplate};
pub use predicate::{Check, StatusPredicate};
pub use provider::{
    ComputeProvider, KeyPair, RefreshableResource, SecondaryKind, SecondaryResource,
    SecondaryResourceApi, SecurityGroup,
};
pub use reconcile::{OrphanReconciler, OrphanSet, ReconcileReport, SecondaryCaches};
pub use resource::{ImageStatus, NodeStatus, ResourceRef, ScopedName, Status, StatusfulResource};
pub use service::{ComputeService, ComputeSettings, DestroyResult, Timeouts};

// Re-export for providers implementing the async traits
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
