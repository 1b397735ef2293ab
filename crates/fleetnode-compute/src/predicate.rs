//! Refresh-and-double-check status predicate

use crate::error::{ComputeError, Result};
use crate::provider::RefreshableResource;
use crate::resource::{ResourceRef, Status, StatusfulResource};
use std::collections::HashSet;

/// Result of one predicate evaluation
///
/// `latest` is the freshest view the predicate had: the refreshed value
/// if it asked the provider, otherwise the cached one. `None` means the
/// provider reported the resource as gone.
#[derive(Debug, Clone)]
pub struct Check<S> {
    pub matched: bool,
    pub latest: Option<StatusfulResource<S>>,
}

/// "Has the resource reached `target`?"
///
/// Fails fast with [`ComputeError::InvalidTerminalStatus`] when a refresh
/// observes one of the invalid statuses.
#[derive(Debug, Clone)]
pub struct StatusPredicate<S: Status> {
    target: S,
    invalid: HashSet<S>,
    deleted_matches: bool,
}

impl<S: Status> StatusPredicate<S> {
    pub fn new(target: S, invalid: impl IntoIterator<Item = S>) -> Self {
        Self {
            target,
            invalid: invalid.into_iter().collect(),
            deleted_matches: false,
        }
    }

    /// Variant that also accepts the resource disappearing
    /// (used when waiting for termination).
    pub fn true_if_deleted(target: S, invalid: impl IntoIterator<Item = S>) -> Self {
        Self {
            deleted_matches: true,
            ..Self::new(target, invalid)
        }
    }

    pub fn target(&self) -> S {
        self.target
    }

    pub fn is_invalid(&self, status: S) -> bool {
        self.invalid.contains(&status)
    }

    /// Evaluate against `cached` first, then against a refreshed value.
    pub async fn check<R>(
        &self,
        source: &R,
        reference: &ResourceRef,
        cached: Option<&StatusfulResource<S>>,
    ) -> Result<Check<S>>
    where
        R: RefreshableResource<S> + ?Sized,
    {
        if let Some(cached) = cached {
            if cached.status == self.target {
                return Ok(Check {
                    matched: true,
                    latest: Some(cached.clone()),
                });
            }
        }

        let Some(fresh) = source.refresh(reference).await? else {
            tracing::debug!(resource = %reference, "resource not found on refresh");
            return Ok(Check {
                matched: self.deleted_matches,
                latest: None,
            });
        };

        if self.is_invalid(fresh.status) {
            return Err(ComputeError::InvalidTerminalStatus {
                resource: reference.clone(),
                status: fresh.status.to_string(),
            });
        }

        tracing::trace!(
            resource = %reference,
            status = %fresh.status,
            target = %self.target,
            "refreshed"
        );

        Ok(Check {
            matched: fresh.status == self.target,
            latest: Some(fresh),
        })
    }
}
