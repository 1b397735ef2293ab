//! Sakura Cloud provider error types

use fleetnode_compute::ComputeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SakuraError {
    #[error("usacloud not found. Please install: brew install usacloud")]
    UsacloudNotFound,

    #[error("usacloud authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("usacloud command failed: {0}")]
    CommandFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The resource exists but cannot take the request in its current state
    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SakuraError>;

impl From<SakuraError> for ComputeError {
    fn from(e: SakuraError) -> Self {
        match e {
            SakuraError::NotFound(msg) => ComputeError::ResourceNotFound(msg),
            SakuraError::AlreadyExists(msg) => ComputeError::CreationConflict(msg),
            SakuraError::Busy(msg) => ComputeError::IllegalState(msg),
            SakuraError::InvalidPlan(msg) => ComputeError::InvalidConfig(msg),
            SakuraError::JsonError(e) => ComputeError::Json(e),
            SakuraError::IoError(e) => ComputeError::Io(e),
            other @ (SakuraError::UsacloudNotFound
            | SakuraError::AuthenticationFailed(_)
            | SakuraError::CommandFailed(_)) => ComputeError::Transport(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_to_engine_errors() {
        let conflict: ComputeError = SakuraError::AlreadyExists("fleet-web".into()).into();
        assert!(conflict.is_conflict());

        let missing: ComputeError = SakuraError::NotFound("1135".into()).into();
        assert!(missing.is_not_found());

        let busy: ComputeError = SakuraError::Busy("still_creating".into()).into();
        assert!(matches!(busy, ComputeError::IllegalState(_)));

        let failed: ComputeError = SakuraError::CommandFailed("503".into()).into();
        assert!(matches!(failed, ComputeError::Transport(_)));
    }
}
