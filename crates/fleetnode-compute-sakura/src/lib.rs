//! Sakura Cloud provider for FleetNode
//!
//! This crate implements the `ComputeProvider` trait for Sakura Cloud,
//! so the convergent engine in `fleetnode-compute` can run node groups
//! there.
//!
//! # Mapping
//!
//! - Node: server (group recorded as a `fleetnode.group=<group>` tag)
//! - Keypair: SSH key (pinned to a zone through its description)
//! - Security group: packet filter
//!
//! # Requirements
//!
//! - `usacloud` CLI must be installed and configured
//! - Authentication is managed through usacloud configuration
//!
//! # Example
//!
//! ```ignore
//! use fleetnode_compute::{ComputeService, ComputeSettings, NodeTemplate, CancellationToken};
//! use fleetnode_compute_sakura::SakuraCloudProvider;
//! use std::sync::Arc;
//!
//! let provider = Arc::new(SakuraCloudProvider::new(["tk1a"]));
//! let service = ComputeService::new(provider, ComputeSettings::default());
//!
//! let template = NodeTemplate::new("tk1a").with_plan("2core-4gb");
//! let nodes = service
//!     .create_nodes_in_group("web", 2, &template, &CancellationToken::new())
//!     .await?;
//! ```

pub mod error;
pub mod provider;
pub mod usacloud;

pub use error::{Result, SakuraError};
pub use provider::SakuraCloudProvider;
pub use usacloud::{CreateServerConfig, PacketFilterInfo, ServerInfo, SshKeyInfo, Usacloud};
