//! usacloud CLI wrapper
//!
//! Wraps the usacloud CLI commands for Sakura Cloud operations. Every call
//! names its zone explicitly so one wrapper serves all zones.

use crate::error::{Result, SakuraError};
use serde::{Deserialize, Deserializer, Serialize};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::process::Command;

/// Tag prefix marking the group a server was created in
pub const GROUP_TAG_PREFIX: &str = "fleetnode.group=";

/// usacloud CLI wrapper
#[derive(Debug, Clone)]
pub struct Usacloud {
    program: String,
}

impl Default for Usacloud {
    fn default() -> Self {
        Self::new("usacloud")
    }
}

impl Usacloud {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Check if usacloud is installed and authenticated
    pub async fn check_auth(&self) -> Result<UsacloudAuth> {
        let output = Command::new(&self.program)
            .args(["auth-status", "--output-type", "json"])
            .kill_on_drop(true)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| spawn_error(e, &self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SakuraError::AuthenticationFailed(stderr.trim().to_string()));
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Run a usacloud command in `zone` and return stdout
    async fn run_command(&self, zone: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--zone").arg(zone);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // an abandoned wait must not leave usacloud running
        cmd.kill_on_drop(true);

        tracing::debug!("Running: {} --zone {} {}", self.program, zone, args.join(" "));

        let output = cmd.output().await.map_err(|e| spawn_error(e, &self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn list<T: for<'de> Deserialize<'de>>(&self, zone: &str, resource: &str) -> Result<Vec<T>> {
        let output = self
            .run_command(zone, &[resource, "list", "--output-type", "json"])
            .await?;
        parse_list(&output)
    }

    /// List all servers in `zone`
    pub async fn list_servers(&self, zone: &str) -> Result<Vec<ServerInfo>> {
        self.list(zone, "server").await
    }

    /// Get server by ID
    pub async fn read_server(&self, zone: &str, id: &str) -> Result<ServerInfo> {
        let output = self
            .run_command(zone, &["server", "read", id, "--output-type", "json"])
            .await?;
        parse_single(&output)
    }

    /// Create a server
    pub async fn create_server(&self, zone: &str, config: &CreateServerConfig) -> Result<ServerInfo> {
        let core_str = config.core.to_string();
        let memory_str = config.memory.to_string();
        let tags = config.tags.join(",");

        let mut args = vec![
            "server",
            "create",
            "--name",
            config.name.as_str(),
            "--core",
            core_str.as_str(),
            "--memory",
            memory_str.as_str(),
            "--output-type",
            "json",
            "--yes",
        ];

        if let Some(ref os) = config.os_type {
            args.push("--os-type");
            args.push(os.as_str());
        }

        if let Some(ref id) = config.ssh_key_id {
            args.push("--disk-edit-ssh-key-id");
            args.push(id.as_str());
        }

        if let Some(ref id) = config.packet_filter_id {
            args.push("--network-interface-packet-filter-id");
            args.push(id.as_str());
        }

        if !tags.is_empty() {
            args.push("--tags");
            args.push(tags.as_str());
        }

        let output = self.run_command(zone, &args).await?;
        parse_single(&output)
    }

    /// Delete a server together with its disks, shutting it down first
    pub async fn delete_server(&self, zone: &str, id: &str) -> Result<()> {
        self.run_command(zone, &["server", "delete", id, "--force", "--with-disks", "--yes"])
            .await?;
        Ok(())
    }

    /// List SSH keys. Keys are global but usacloud still takes a zone.
    pub async fn list_ssh_keys(&self, zone: &str) -> Result<Vec<SshKeyInfo>> {
        self.list(zone, "ssh-key").await
    }

    /// Generate an SSH key pair; the private key is only returned here
    pub async fn generate_ssh_key(
        &self,
        zone: &str,
        name: &str,
        description: &str,
    ) -> Result<SshKeyInfo> {
        let output = self
            .run_command(
                zone,
                &[
                    "ssh-key",
                    "generate",
                    "--name",
                    name,
                    "--description",
                    description,
                    "--output-type",
                    "json",
                    "--yes",
                ],
            )
            .await?;
        parse_single(&output)
    }

    pub async fn delete_ssh_key(&self, zone: &str, id: &str) -> Result<()> {
        self.run_command(zone, &["ssh-key", "delete", id, "--yes"]).await?;
        Ok(())
    }

    pub async fn list_packet_filters(&self, zone: &str) -> Result<Vec<PacketFilterInfo>> {
        self.list(zone, "packet-filter").await
    }

    /// Create a packet filter allowing `inbound_ports` and denying the rest
    pub async fn create_packet_filter(
        &self,
        zone: &str,
        name: &str,
        inbound_ports: &[u16],
    ) -> Result<PacketFilterInfo> {
        let parameters = packet_filter_parameters(name, inbound_ports).to_string();
        let output = self
            .run_command(
                zone,
                &[
                    "packet-filter",
                    "create",
                    "--parameters",
                    parameters.as_str(),
                    "--output-type",
                    "json",
                    "--yes",
                ],
            )
            .await?;
        parse_single(&output)
    }

    pub async fn delete_packet_filter(&self, zone: &str, id: &str) -> Result<()> {
        self.run_command(zone, &["packet-filter", "delete", id, "--yes"])
            .await?;
        Ok(())
    }
}

fn spawn_error(e: std::io::Error, program: &str) -> SakuraError {
    if e.kind() == ErrorKind::NotFound {
        tracing::debug!(program, "usacloud binary not found");
        SakuraError::UsacloudNotFound
    } else {
        SakuraError::IoError(e)
    }
}

/// Map usacloud's stderr to the failure it describes
pub fn classify_failure(stderr: &str) -> SakuraError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if has_status_code(&lower, "404") || lower.contains("not found") {
        SakuraError::NotFound(message)
    } else if ["still_creating", "busy", "in use", "is running", "migrating"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        SakuraError::Busy(message)
    } else if has_status_code(&lower, "409") || lower.contains("already exists") {
        SakuraError::AlreadyExists(message)
    } else {
        SakuraError::CommandFailed(message)
    }
}

/// `code` as a whole token, so resource IDs that contain it do not count
fn has_status_code(message: &str, code: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| token == code)
}

/// usacloud prints either an object or a one-element array for single reads
fn parse_single<T: for<'de> Deserialize<'de>>(output: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(output.trim())?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

fn parse_list<T: for<'de> Deserialize<'de>>(output: &str) -> Result<Vec<T>> {
    let output = output.trim();
    if output.is_empty() || output == "[]" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(output)?)
}

fn packet_filter_parameters(name: &str, inbound_ports: &[u16]) -> serde_json::Value {
    let mut expression: Vec<serde_json::Value> = inbound_ports
        .iter()
        .map(|port| {
            serde_json::json!({
                "Protocol": "tcp",
                "DestinationPort": port.to_string(),
                "Action": "allow",
            })
        })
        .collect();
    // Return traffic of outbound connections
    expression.push(serde_json::json!({
        "Protocol": "tcp",
        "DestinationPort": "32768-61000",
        "Action": "allow",
    }));
    expression.push(serde_json::json!({ "Protocol": "ip", "Action": "deny" }));

    serde_json::json!({
        "Name": name,
        "Description": "managed by fleetnode",
        "Expression": expression,
    })
}

/// Sakura IDs come back as numbers or strings depending on the command
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(u64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Authentication status from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsacloudAuth {
    #[serde(rename = "Account")]
    pub account: Option<AccountInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "ID", deserialize_with = "id_string")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Server information from usacloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "ID", deserialize_with = "id_string")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "CPU")]
    pub cpu: Option<i32>,

    #[serde(rename = "MemoryMB")]
    pub memory_mb: Option<i32>,

    #[serde(rename = "Availability")]
    pub availability: Option<String>,

    #[serde(rename = "InstanceStatus")]
    pub instance_status: Option<String>,

    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Interfaces")]
    pub interfaces: Option<Vec<InterfaceInfo>>,
}

impl ServerInfo {
    /// Get the first IP address
    pub fn ip_address(&self) -> Option<String> {
        self.interfaces
            .as_ref()?
            .iter()
            .find_map(|i| i.ip_address.clone())
    }

    /// Group recorded in the server's tags
    pub fn group(&self) -> Option<&str> {
        self.tags
            .iter()
            .find_map(|tag| tag.strip_prefix(GROUP_TAG_PREFIX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    #[serde(rename = "IPAddress")]
    pub ip_address: Option<String>,
}

/// Configuration for creating a server
#[derive(Debug, Clone)]
pub struct CreateServerConfig {
    pub name: String,
    pub core: i32,
    pub memory: i32,
    pub os_type: Option<String>,
    pub ssh_key_id: Option<String>,
    pub packet_filter_id: Option<String>,
    pub tags: Vec<String>,
}

/// SSH key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKeyInfo {
    #[serde(rename = "ID", deserialize_with = "id_string")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Description")]
    pub description: Option<String>,

    #[serde(rename = "PublicKey")]
    pub public_key: Option<String>,

    #[serde(rename = "Fingerprint")]
    pub fingerprint: Option<String>,

    /// Only set by `ssh-key generate`
    #[serde(rename = "PrivateKey")]
    pub private_key: Option<String>,
}

/// Packet filter information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketFilterInfo {
    #[serde(rename = "ID", deserialize_with = "id_string")]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Expression", default)]
    pub expression: Vec<PacketFilterRule>,
}

impl PacketFilterInfo {
    /// TCP ports explicitly allowed
    pub fn allowed_ports(&self) -> Vec<u16> {
        self.expression
            .iter()
            .filter(|rule| rule.action.as_deref() == Some("allow"))
            .filter_map(|rule| rule.destination_port.as_deref()?.parse().ok())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketFilterRule {
    #[serde(rename = "Protocol")]
    pub protocol: Option<String>,
    #[serde(rename = "DestinationPort")]
    pub destination_port: Option<String>,
    #[serde(rename = "Action")]
    pub action: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_info_parses_numeric_id_and_tags() {
        let output = r#"[{
            "ID": 113500000001,
            "Name": "fleet-web-0a1b2c3d",
            "CPU": 2,
            "MemoryMB": 4096,
            "Availability": "available",
            "InstanceStatus": "up",
            "Tags": ["fleetnode.group=web", "@auto-reboot"],
            "Interfaces": [{"IPAddress": "192.0.2.10"}]
        }]"#;

        let servers: Vec<ServerInfo> = parse_list(output).unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, "113500000001");
        assert_eq!(servers[0].group(), Some("web"));
        assert_eq!(servers[0].ip_address(), Some("192.0.2.10".to_string()));
    }

    #[test]
    fn test_parse_single_accepts_array_or_object() {
        let key: SshKeyInfo = parse_single(r#"[{"ID": "1", "Name": "fleet-web"}]"#).unwrap();
        assert_eq!(key.name, "fleet-web");

        let key: SshKeyInfo = parse_single(r#"{"ID": 2, "Name": "fleet-db"}"#).unwrap();
        assert_eq!(key.id, "2");
    }

    #[test]
    fn test_empty_list() {
        let filters: Vec<PacketFilterInfo> = parse_list("  \n").unwrap();
        assert!(filters.is_empty());
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("Error: 404 Not Found: server 1135"),
            SakuraError::NotFound(_)
        ));
        assert!(matches!(
            classify_failure("Error: 409 Conflict: still_creating"),
            SakuraError::Busy(_)
        ));
        assert!(matches!(
            classify_failure("Error: 409 Conflict: name already exists"),
            SakuraError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_failure("Error: 503 Service Unavailable"),
            SakuraError::CommandFailed(_)
        ));
    }

    #[test]
    fn test_classify_failure_ignores_codes_inside_ids() {
        assert!(matches!(
            classify_failure("Error: 503 Service Unavailable: server 113404000001"),
            SakuraError::CommandFailed(_)
        ));
        assert!(matches!(
            classify_failure("Error: 500 Internal Server Error: packet filter 113409000002"),
            SakuraError::CommandFailed(_)
        ));
        assert!(matches!(
            classify_failure("Error: 404: server 113404000001"),
            SakuraError::NotFound(_)
        ));
    }

    #[test]
    fn test_packet_filter_parameters() {
        let params = packet_filter_parameters("fleet-web", &[22, 443]);
        let rules = params["Expression"].as_array().unwrap();

        assert_eq!(params["Name"], "fleet-web");
        assert_eq!(rules[0]["DestinationPort"], "22");
        assert_eq!(rules[1]["DestinationPort"], "443");
        assert_eq!(rules.last().unwrap()["Action"], "deny");
    }

    #[test]
    fn test_allowed_ports() {
        let mut params = packet_filter_parameters("fleet-web", &[22, 80]);
        params["ID"] = serde_json::json!(1);

        let filter: PacketFilterInfo = serde_json::from_value(params).unwrap();

        assert_eq!(filter.allowed_ports(), vec![22, 80]);
    }
}
