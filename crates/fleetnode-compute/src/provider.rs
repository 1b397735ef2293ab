//! Provider-facing traits
//!
//! The engine never talks to a cloud directly. Each provider adapter
//! (Sakura Cloud, ...) implements these traits and the engine drives them.

use crate::error::Result;
use crate::node::{NodeMetadata, NodeSpec};
use crate::resource::{NodeStatus, ResourceRef, ScopedName, Status, StatusfulResource};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fetch the latest representation of a resource.
///
/// `Ok(None)` means the provider no longer knows the resource. Errors are
/// transport failures and are retried by callers that poll.
#[async_trait]
pub trait RefreshableResource<S: Status>: Send + Sync {
    async fn refresh(&self, reference: &ResourceRef) -> Result<Option<StatusfulResource<S>>>;
}

/// Kind of secondary resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecondaryKind {
    KeyPair,
    SecurityGroup,
}

impl fmt::Display for SecondaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecondaryKind::KeyPair => write!(f, "key-pair"),
            SecondaryKind::SecurityGroup => write!(f, "security-group"),
        }
    }
}

/// A secondary resource as listed by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryResource {
    pub kind: SecondaryKind,
    pub reference: ResourceRef,
    pub name: String,
}

impl SecondaryResource {
    pub fn new(kind: SecondaryKind, reference: ResourceRef, name: impl Into<String>) -> Self {
        Self {
            kind,
            reference,
            name: name.into(),
        }
    }

    /// Cache key of this resource
    pub fn key(&self) -> ScopedName {
        ScopedName::new(self.reference.scope.clone(), self.name.clone())
    }
}

/// Listing and deletion of secondary resources within a scope
#[async_trait]
pub trait SecondaryResourceApi: Send + Sync {
    /// All keypairs and security groups in `scope`
    async fn list_in_scope(&self, scope: &str) -> Result<Vec<SecondaryResource>>;

    /// Delete one resource. A missing resource is reported as
    /// [`ComputeError::ResourceNotFound`](crate::ComputeError::ResourceNotFound).
    async fn delete(&self, resource: &SecondaryResource) -> Result<()>;
}

/// Keypair created or found for a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub reference: ResourceRef,
    pub name: String,
    pub fingerprint: Option<String>,
    /// Only present when this process created the keypair
    pub private_key: Option<String>,
}

/// Security group created or found for a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub reference: ResourceRef,
    pub name: String,
    pub inbound_ports: Vec<u16>,
}

/// Compute provider abstraction trait
///
/// All providers implement this trait so that node creation, destruction
/// and secondary resource handling share one convergent engine.
#[async_trait]
pub trait ComputeProvider: RefreshableResource<NodeStatus> + SecondaryResourceApi {
    /// Returns the provider name (e.g., "sakura-cloud")
    fn name(&self) -> &str;

    /// Request a node. Returns the provider's first observation, which is
    /// usually still pending.
    async fn create_node(&self, spec: &NodeSpec) -> Result<StatusfulResource<NodeStatus>>;

    /// Request destruction of a node.
    ///
    /// Providers return [`ComputeError::IllegalState`](crate::ComputeError::IllegalState)
    /// when the node cannot be destroyed yet (e.g. still booting).
    async fn destroy_node(&self, reference: &ResourceRef) -> Result<()>;

    /// All nodes visible to this provider
    async fn list_nodes(&self) -> Result<Vec<NodeMetadata>>;

    /// Create a keypair. A name collision is reported as
    /// [`ComputeError::CreationConflict`](crate::ComputeError::CreationConflict).
    async fn create_key_pair(&self, scope: &str, name: &str) -> Result<KeyPair>;

    async fn find_key_pair(&self, scope: &str, name: &str) -> Result<Option<KeyPair>>;

    /// Create a security group allowing the given inbound TCP ports.
    async fn create_security_group(
        &self,
        scope: &str,
        name: &str,
        inbound_ports: &[u16],
    ) -> Result<SecurityGroup>;

    async fn find_security_group(&self, scope: &str, name: &str) -> Result<Option<SecurityGroup>>;

    /// Public address carried by a node observation, if the provider exposes one
    fn public_address(&self, _node: &StatusfulResource<NodeStatus>) -> Option<String> {
        None
    }
}
