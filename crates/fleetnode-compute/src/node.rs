//! Node descriptions passed between the engine and providers

use crate::resource::{NodeStatus, ResourceRef};
use serde::{Deserialize, Serialize};

/// A node as listed by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub reference: ResourceRef,
    pub name: String,
    /// Group the node was created in, if the provider can tell
    pub group: Option<String>,
    pub status: NodeStatus,
    pub public_address: Option<String>,
}

impl NodeMetadata {
    /// Terminated nodes no longer hold on to their group's resources
    pub fn is_live(&self) -> bool {
        self.status != NodeStatus::Terminated
    }
}

/// What every node of a group should look like
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Region or zone to create the nodes in
    pub scope: String,
    /// Provider image (OS) identifier
    pub image: Option<String>,
    /// Provider size/plan identifier (e.g. "2core-4gb")
    pub plan: Option<String>,
    /// Inbound TCP ports opened by the group's security group
    pub inbound_ports: Vec<u16>,
}

impl NodeTemplate {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_inbound_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.inbound_ports = ports.into_iter().collect();
        self
    }
}

/// A single node creation request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub scope: String,
    pub name: String,
    pub group: String,
    pub image: Option<String>,
    pub plan: Option<String>,
    pub key_pair: Option<String>,
    pub security_group: Option<String>,
}
