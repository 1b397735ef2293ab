//! Compute engine error types

use crate::resource::{ResourceRef, ScopedName};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Compute engine errors
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Resource {resource} reached invalid status '{status}'")]
    InvalidTerminalStatus {
        resource: ResourceRef,
        status: String,
    },

    #[error("Timed out after {waited:?} waiting for {resource} to become '{target}'")]
    TimedOut {
        resource: ResourceRef,
        target: String,
        waited: Duration,
    },

    #[error("Wait for {resource} was cancelled")]
    Cancelled { resource: ResourceRef },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource already exists: {0}")]
    CreationConflict(String),

    #[error("Could not create or find {key} after {attempts} attempts")]
    CreationRaceUnresolved { key: ScopedName, attempts: u32 },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Failed to delete {count} orphaned resource(s): {0}", count = .0.failures.len())]
    PartialReconciliationFailure(ReconcileFailures),

    #[error("Invalid group name '{0}': use lowercase letters, digits and '-'")]
    InvalidGroupName(String),

    #[error("{0}")]
    RunNodes(Box<RunNodesFailure>),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ComputeError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ComputeError::CreationConflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ComputeError::ResourceNotFound(_))
    }
}

/// A secondary resource (or a whole scope listing) that failed during
/// reconciliation.
#[derive(Debug, Clone)]
pub struct ReconcileFailure {
    pub scope: String,
    /// `None` when listing the scope failed
    pub name: Option<String>,
    pub error: String,
}

impl fmt::Display for ReconcileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}: {}", ScopedName::new(&self.scope, name), self.error),
            None => write!(f, "{} (listing): {}", self.scope, self.error),
        }
    }
}

/// Every per-resource failure of one reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileFailures {
    pub failures: Vec<ReconcileFailure>,
}

impl fmt::Display for ReconcileFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Partial outcome of a batch node creation.
#[derive(Debug)]
pub struct RunNodesFailure {
    pub group: String,
    pub requested: usize,
    pub good: Vec<crate::node::NodeMetadata>,
    /// Node name paired with the reason it failed.
    pub failed: Vec<(String, ComputeError)>,
}

impl fmt::Display for RunNodesFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Group '{}': {} of {} node(s) failed",
            self.group,
            self.failed.len(),
            self.requested
        )?;
        for (name, error) in &self.failed {
            write!(f, "\n  {}: {}", name, error)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, ComputeError>;
