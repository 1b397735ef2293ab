//! Sakura Cloud provider implementation

use crate::error::{Result, SakuraError};
use crate::usacloud::{
    CreateServerConfig, GROUP_TAG_PREFIX, PacketFilterInfo, ServerInfo, SshKeyInfo, Usacloud,
    UsacloudAuth,
};
use async_trait::async_trait;
use fleetnode_compute::{
    ComputeError, ComputeProvider, GroupNamingConvention, KeyPair, NodeMetadata, NodeSpec, NodeStatus,
    RefreshableResource, ResourceRef, SecondaryKind, SecondaryResource, SecondaryResourceApi,
    SecurityGroup, StatusfulResource,
};

/// Parse plan string like "2core-4gb" to (core, memory_gb)
fn parse_plan(plan: Option<&str>) -> Result<(i32, i32)> {
    let Some(plan) = plan else {
        return Ok((1, 1));
    };

    let parsed = plan.split_once('-').and_then(|(core, memory)| {
        let core = core.strip_suffix("core")?.parse::<i32>().ok()?;
        let memory = memory.strip_suffix("gb")?.parse::<i32>().ok()?;
        Some((core, memory))
    });

    parsed.ok_or_else(|| SakuraError::InvalidPlan(plan.to_string()))
}

/// Node status of a server, from its availability and power state
fn status_of(server: &ServerInfo) -> NodeStatus {
    match server.availability.as_deref() {
        Some("failed") => return NodeStatus::Error,
        Some("migrating") | Some("uploading") => return NodeStatus::Pending,
        _ => {}
    }

    match server.instance_status.as_deref() {
        Some("up") => NodeStatus::Running,
        Some("cleaning") => NodeStatus::Stopping,
        Some("down") => NodeStatus::Stopped,
        None | Some("") => NodeStatus::Pending,
        Some(_) => NodeStatus::Unrecognized,
    }
}

fn observation(zone: &str, server: &ServerInfo) -> StatusfulResource<NodeStatus> {
    StatusfulResource::new(ResourceRef::new(zone, server.id.clone()), status_of(server))
        .with_raw(serde_json::to_value(server).unwrap_or_default())
}

/// SSH keys are account wide; the description pins a key to one zone
fn zone_marker(zone: &str) -> String {
    format!("fleetnode:zone={zone}")
}

/// Group tag of a server, else the group encoded in its name
fn group_of_server(server: &ServerInfo, naming: &GroupNamingConvention) -> Option<String> {
    server
        .group()
        .map(str::to_string)
        .or_else(|| naming.group_in_unique_name(&server.name))
}

fn key_in_zone(key: &SshKeyInfo, zone: &str) -> bool {
    key.description.as_deref() == Some(zone_marker(zone).as_str())
}

/// Sakura Cloud provider
pub struct SakuraCloudProvider {
    usacloud: Usacloud,
    zones: Vec<String>,
    naming: GroupNamingConvention,
}

impl SakuraCloudProvider {
    /// Provider managing nodes in the given zones (e.g. "tk1a", "is1b")
    pub fn new(zones: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self::with_usacloud(Usacloud::default(), zones)
    }

    pub fn with_usacloud(
        usacloud: Usacloud,
        zones: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            usacloud,
            zones: zones.into_iter().map(Into::into).collect(),
            naming: GroupNamingConvention::default(),
        }
    }

    /// Naming used to recover the group of servers that lost their tag
    pub fn with_naming(mut self, naming: GroupNamingConvention) -> Self {
        self.naming = naming;
        self
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    pub async fn check_auth(&self) -> Result<UsacloudAuth> {
        self.usacloud.check_auth().await
    }

    async fn ssh_key_named(&self, zone: &str, name: &str) -> Result<Option<SshKeyInfo>> {
        Ok(self
            .usacloud
            .list_ssh_keys(zone)
            .await?
            .into_iter()
            .find(|key| key.name == name && key_in_zone(key, zone)))
    }

    async fn packet_filter_named(&self, zone: &str, name: &str) -> Result<Option<PacketFilterInfo>> {
        Ok(self
            .usacloud
            .list_packet_filters(zone)
            .await?
            .into_iter()
            .find(|filter| filter.name == name))
    }
}

fn to_key_pair(zone: &str, key: SshKeyInfo) -> KeyPair {
    KeyPair {
        reference: ResourceRef::new(zone, key.id),
        name: key.name,
        fingerprint: key.fingerprint,
        private_key: key.private_key,
    }
}

fn to_security_group(zone: &str, filter: PacketFilterInfo) -> SecurityGroup {
    SecurityGroup {
        inbound_ports: filter.allowed_ports(),
        reference: ResourceRef::new(zone, filter.id),
        name: filter.name,
    }
}

#[async_trait]
impl RefreshableResource<NodeStatus> for SakuraCloudProvider {
    async fn refresh(
        &self,
        reference: &ResourceRef,
    ) -> fleetnode_compute::Result<Option<StatusfulResource<NodeStatus>>> {
        match self
            .usacloud
            .read_server(&reference.scope, &reference.id)
            .await
        {
            Ok(server) => Ok(Some(observation(&reference.scope, &server))),
            Err(SakuraError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SecondaryResourceApi for SakuraCloudProvider {
    async fn list_in_scope(&self, scope: &str) -> fleetnode_compute::Result<Vec<SecondaryResource>> {
        let keys = self.usacloud.list_ssh_keys(scope).await?;
        let filters = self.usacloud.list_packet_filters(scope).await?;

        let keys = keys
            .into_iter()
            .filter(|key| key_in_zone(key, scope))
            .map(|key| {
                SecondaryResource::new(SecondaryKind::KeyPair, ResourceRef::new(scope, key.id), key.name)
            });
        let filters = filters.into_iter().map(|filter| {
            SecondaryResource::new(
                SecondaryKind::SecurityGroup,
                ResourceRef::new(scope, filter.id),
                filter.name,
            )
        });

        Ok(keys.chain(filters).collect())
    }

    async fn delete(&self, resource: &SecondaryResource) -> fleetnode_compute::Result<()> {
        let zone = &resource.reference.scope;
        let id = &resource.reference.id;
        let result = match resource.kind {
            SecondaryKind::KeyPair => self.usacloud.delete_ssh_key(zone, id).await,
            SecondaryKind::SecurityGroup => self.usacloud.delete_packet_filter(zone, id).await,
        };
        result.map_err(Into::into)
    }
}

#[async_trait]
impl ComputeProvider for SakuraCloudProvider {
    fn name(&self) -> &str {
        "sakura-cloud"
    }

    async fn create_node(
        &self,
        spec: &NodeSpec,
    ) -> fleetnode_compute::Result<StatusfulResource<NodeStatus>> {
        let (core, memory) = parse_plan(spec.plan.as_deref())?;

        let ssh_key_id = match &spec.key_pair {
            Some(name) => Some(
                self.ssh_key_named(&spec.scope, name)
                    .await?
                    .ok_or_else(|| ComputeError::ResourceNotFound(format!("ssh-key {name}")))?
                    .id,
            ),
            None => None,
        };
        let packet_filter_id = match &spec.security_group {
            Some(name) => Some(
                self.packet_filter_named(&spec.scope, name)
                    .await?
                    .ok_or_else(|| ComputeError::ResourceNotFound(format!("packet-filter {name}")))?
                    .id,
            ),
            None => None,
        };

        let config = CreateServerConfig {
            name: spec.name.clone(),
            core,
            memory,
            os_type: spec.image.clone(),
            ssh_key_id,
            packet_filter_id,
            tags: vec![format!("{GROUP_TAG_PREFIX}{}", spec.group)],
        };

        let server = self.usacloud.create_server(&spec.scope, &config).await?;
        tracing::info!(zone = %spec.scope, id = %server.id, name = %server.name, "server created");
        Ok(observation(&spec.scope, &server))
    }

    async fn destroy_node(&self, reference: &ResourceRef) -> fleetnode_compute::Result<()> {
        self.usacloud
            .delete_server(&reference.scope, &reference.id)
            .await?;
        tracing::info!(zone = %reference.scope, id = %reference.id, "server deleted");
        Ok(())
    }

    async fn list_nodes(&self) -> fleetnode_compute::Result<Vec<NodeMetadata>> {
        let mut nodes = Vec::new();
        for zone in &self.zones {
            for server in self.usacloud.list_servers(zone).await? {
                nodes.push(NodeMetadata {
                    reference: ResourceRef::new(zone.clone(), server.id.clone()),
                    group: group_of_server(&server, &self.naming),
                    status: status_of(&server),
                    public_address: server.ip_address(),
                    name: server.name,
                });
            }
        }
        Ok(nodes)
    }

    /// Sakura does not enforce unique key names, so an existing key with
    /// this name in the zone is reported as a conflict.
    async fn create_key_pair(&self, scope: &str, name: &str) -> fleetnode_compute::Result<KeyPair> {
        if self.ssh_key_named(scope, name).await?.is_some() {
            return Err(ComputeError::CreationConflict(format!("ssh-key {name}")));
        }
        let key = self
            .usacloud
            .generate_ssh_key(scope, name, &zone_marker(scope))
            .await?;
        tracing::info!(zone = scope, name, "ssh key generated");
        Ok(to_key_pair(scope, key))
    }

    async fn find_key_pair(
        &self,
        scope: &str,
        name: &str,
    ) -> fleetnode_compute::Result<Option<KeyPair>> {
        Ok(self
            .ssh_key_named(scope, name)
            .await?
            .map(|key| to_key_pair(scope, key)))
    }

    async fn create_security_group(
        &self,
        scope: &str,
        name: &str,
        inbound_ports: &[u16],
    ) -> fleetnode_compute::Result<SecurityGroup> {
        if self.packet_filter_named(scope, name).await?.is_some() {
            return Err(ComputeError::CreationConflict(format!("packet-filter {name}")));
        }
        let filter = self
            .usacloud
            .create_packet_filter(scope, name, inbound_ports)
            .await?;
        tracing::info!(zone = scope, name, ports = ?inbound_ports, "packet filter created");
        Ok(to_security_group(scope, filter))
    }

    async fn find_security_group(
        &self,
        scope: &str,
        name: &str,
    ) -> fleetnode_compute::Result<Option<SecurityGroup>> {
        Ok(self
            .packet_filter_named(scope, name)
            .await?
            .map(|filter| to_security_group(scope, filter)))
    }

    fn public_address(&self, node: &StatusfulResource<NodeStatus>) -> Option<String> {
        serde_json::from_value::<ServerInfo>(node.raw.clone())
            .ok()?
            .ip_address()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(availability: Option<&str>, instance_status: Option<&str>) -> ServerInfo {
        ServerInfo {
            id: "113500000001".to_string(),
            name: "fleet-web-0a1b2c3d".to_string(),
            cpu: Some(2),
            memory_mb: Some(4096),
            availability: availability.map(str::to_string),
            instance_status: instance_status.map(str::to_string),
            tags: vec!["fleetnode.group=web".to_string()],
            interfaces: None,
        }
    }

    #[test]
    fn test_parse_plan() {
        assert_eq!(parse_plan(Some("2core-4gb")).unwrap(), (2, 4));
        assert_eq!(parse_plan(None).unwrap(), (1, 1));
        assert!(matches!(
            parse_plan(Some("large")),
            Err(SakuraError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_of(&server(Some("available"), Some("up"))), NodeStatus::Running);
        assert_eq!(status_of(&server(Some("available"), Some("down"))), NodeStatus::Stopped);
        assert_eq!(
            status_of(&server(Some("available"), Some("cleaning"))),
            NodeStatus::Stopping
        );
        assert_eq!(status_of(&server(Some("migrating"), None)), NodeStatus::Pending);
        assert_eq!(status_of(&server(Some("failed"), Some("down"))), NodeStatus::Error);
        assert_eq!(
            status_of(&server(Some("available"), Some("rebooting"))),
            NodeStatus::Unrecognized
        );
    }

    #[test]
    fn test_public_address_from_observation() {
        let mut info = server(Some("available"), Some("up"));
        info.interfaces = Some(vec![crate::usacloud::InterfaceInfo {
            ip_address: Some("192.0.2.10".to_string()),
        }]);
        let provider = SakuraCloudProvider::new(["tk1a"]);

        let node = observation("tk1a", &info);

        assert_eq!(node.reference, ResourceRef::new("tk1a", "113500000001"));
        assert_eq!(provider.public_address(&node), Some("192.0.2.10".to_string()));
    }

    #[test]
    fn test_keys_are_pinned_to_their_zone() {
        let key = SshKeyInfo {
            id: "1".to_string(),
            name: "fleet-web".to_string(),
            description: Some(zone_marker("tk1a")),
            public_key: None,
            fingerprint: None,
            private_key: None,
        };

        assert!(key_in_zone(&key, "tk1a"));
        assert!(!key_in_zone(&key, "is1b"));
    }

    #[test]
    fn test_group_falls_back_to_node_name() {
        let naming = GroupNamingConvention::default();
        let mut info = server(Some("available"), Some("up"));
        assert_eq!(group_of_server(&info, &naming), Some("web".to_string()));

        info.tags.clear();
        info.name = "fleet-db-0a1b2c3d".to_string();
        assert_eq!(group_of_server(&info, &naming), Some("db".to_string()));

        info.name = "handmade-server".to_string();
        assert_eq!(group_of_server(&info, &naming), None);

        let acme = GroupNamingConvention::new("acme");
        info.name = "fleet-db-0a1b2c3d".to_string();
        assert_eq!(group_of_server(&info, &acme), None);
    }
}
