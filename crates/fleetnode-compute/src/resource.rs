//! Resource identity and observed status
//!
//! Every remote resource the engine polls is addressed by a [`ResourceRef`]
//! and observed as a [`StatusfulResource`]. Secondary resources (keypairs,
//! security groups) are addressed by a [`ScopedName`] instead, since their
//! names are only unique within a scope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Reference to a resource within a provider partition (region or zone)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub scope: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(scope: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.id)
    }
}

/// Name of a secondary resource, unique within its scope
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopedName {
    pub scope: String,
    pub name: String,
}

impl ScopedName {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ScopedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Marker for per-kind status enums.
pub trait Status:
    Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
}

impl<T> Status for T where T: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{}

/// Status of a compute node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Node is being provisioned
    Pending,
    /// Node is up
    Running,
    /// Node is shutting down
    Stopping,
    /// Node is powered off
    Stopped,
    /// Node has been destroyed
    Terminated,
    /// Provider reported a failure
    Error,
    /// Provider reported something we cannot map
    Unrecognized,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Pending => write!(f, "pending"),
            NodeStatus::Running => write!(f, "running"),
            NodeStatus::Stopping => write!(f, "stopping"),
            NodeStatus::Stopped => write!(f, "stopped"),
            NodeStatus::Terminated => write!(f, "terminated"),
            NodeStatus::Error => write!(f, "error"),
            NodeStatus::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

impl NodeStatus {
    /// Parse a status name as printed by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "terminated" => Some(Self::Terminated),
            "error" => Some(Self::Error),
            "unrecognized" => Some(Self::Unrecognized),
            _ => None,
        }
    }
}

/// Status of a machine image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Queued,
    Saving,
    Active,
    Error,
    Unrecognized,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageStatus::Queued => write!(f, "queued"),
            ImageStatus::Saving => write!(f, "saving"),
            ImageStatus::Active => write!(f, "active"),
            ImageStatus::Error => write!(f, "error"),
            ImageStatus::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// One observation of a remote resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusfulResource<S> {
    pub reference: ResourceRef,
    pub status: S,
    /// Provider payload, passed through untouched
    pub raw: serde_json::Value,
    /// When the provider was asked
    pub observed_at: DateTime<Utc>,
}

impl<S: Status> StatusfulResource<S> {
    pub fn new(reference: ResourceRef, status: S) -> Self {
        Self {
            reference,
            status,
            raw: serde_json::Value::Null,
            observed_at: Utc::now(),
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.observed_at = at;
        self
    }

    /// Keep whichever of `self` and `other` was observed last.
    ///
    /// Ties go to `other`, so a refresh taken in the same instant still
    /// replaces the cached view.
    pub fn freshest(self, other: Self) -> Self {
        if other.observed_at >= self.observed_at {
            other
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_scoped_name_equality() {
        assert_eq!(ScopedName::new("tk1a", "web"), ScopedName::new("tk1a", "web"));
        assert_ne!(ScopedName::new("tk1a", "web"), ScopedName::new("is1a", "web"));
        assert_ne!(ScopedName::new("tk1a", "web"), ScopedName::new("tk1a", "Web"));
    }

    #[test]
    fn test_freshest_prefers_newer_observation() {
        let reference = ResourceRef::new("us-1", "i-123");
        let now = Utc::now();
        let older = StatusfulResource::new(reference.clone(), NodeStatus::Running)
            .observed_at(now - Duration::seconds(5));
        let newer = StatusfulResource::new(reference, NodeStatus::Pending).observed_at(now);

        assert_eq!(older.clone().freshest(newer.clone()).status, NodeStatus::Pending);
        assert_eq!(newer.freshest(older).status, NodeStatus::Pending);
    }

    #[test]
    fn test_node_status_parse() {
        assert_eq!(NodeStatus::parse("Running"), Some(NodeStatus::Running));
        assert_eq!(NodeStatus::parse("terminated"), Some(NodeStatus::Terminated));
        assert_eq!(NodeStatus::parse("booting"), None);
    }
}
