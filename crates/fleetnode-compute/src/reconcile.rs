//! Orphaned secondary resource cleanup
//!
//! After nodes are destroyed, the keypairs and security groups of groups
//! with no live node left are deleted and evicted from the caches.

use crate::cache::KeyedResourceCache;
use crate::error::{ComputeError, ReconcileFailure, ReconcileFailures, Result};
use crate::naming::GroupOf;
use crate::node::NodeMetadata;
use crate::provider::{KeyPair, SecondaryKind, SecondaryResource, SecondaryResourceApi, SecurityGroup};
use crate::resource::ScopedName;
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet};

/// Groups whose nodes are all gone, by scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanSet {
    groups: BTreeMap<String, BTreeSet<String>>,
}

impl OrphanSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scope: impl Into<String>, group: impl Into<String>) {
        self.groups
            .entry(scope.into())
            .or_default()
            .insert(group.into());
    }

    /// Groups of `destroyed` that have no live node left in `remaining`.
    ///
    /// Nodes without a group are ignored.
    pub fn from_destroyed(destroyed: &[NodeMetadata], remaining: &[NodeMetadata]) -> Self {
        let still_used: BTreeSet<(&str, &str)> = remaining
            .iter()
            .filter(|node| node.is_live())
            .filter_map(|node| Some((node.reference.scope.as_str(), node.group.as_deref()?)))
            .collect();

        let mut set = Self::new();
        for node in destroyed {
            let Some(group) = node.group.as_deref() else {
                continue;
            };
            let scope = node.reference.scope.as_str();
            if !still_used.contains(&(scope, group)) {
                set.insert(scope, group);
            }
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn contains(&self, scope: &str, group: &str) -> bool {
        self.groups
            .get(scope)
            .is_some_and(|groups| groups.contains(group))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.groups.iter()
    }
}

/// The caches whose entries reconciliation keeps in line with the provider
#[derive(Default)]
pub struct SecondaryCaches {
    pub key_pairs: KeyedResourceCache<KeyPair>,
    pub security_groups: KeyedResourceCache<SecurityGroup>,
}

impl SecondaryCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the entry of `kind` under `key`; true if one was resolved
    pub fn invalidate(&self, kind: SecondaryKind, key: &ScopedName) -> bool {
        match kind {
            SecondaryKind::KeyPair => self.key_pairs.invalidate(key).is_some(),
            SecondaryKind::SecurityGroup => self.security_groups.invalidate(key).is_some(),
        }
    }

    /// Resolved keys of `kind` in `scope`
    pub fn keys_in_scope(&self, kind: SecondaryKind, scope: &str) -> Vec<ScopedName> {
        match kind {
            SecondaryKind::KeyPair => self.key_pairs.keys_in_scope(scope),
            SecondaryKind::SecurityGroup => self.security_groups.keys_in_scope(scope),
        }
    }
}

/// What one reconciliation pass did
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub deleted: Vec<SecondaryResource>,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Err(PartialReconciliationFailure)` if anything failed
    pub fn into_result(self) -> Result<Vec<SecondaryResource>> {
        if self.failures.is_empty() {
            Ok(self.deleted)
        } else {
            Err(ComputeError::PartialReconciliationFailure(ReconcileFailures {
                failures: self.failures,
            }))
        }
    }
}

/// Deletes secondary resources of orphaned groups
pub struct OrphanReconciler<'a, A: ?Sized> {
    api: &'a A,
    naming: &'a dyn GroupOf,
    caches: &'a SecondaryCaches,
}

impl<'a, A> OrphanReconciler<'a, A>
where
    A: SecondaryResourceApi + ?Sized,
{
    pub fn new(api: &'a A, naming: &'a dyn GroupOf, caches: &'a SecondaryCaches) -> Self {
        Self { api, naming, caches }
    }

    /// Delete every secondary resource owned by a group in `orphans`.
    ///
    /// One failed deletion never stops the others; all failures end up in
    /// the report.
    pub async fn reconcile(&self, orphans: &OrphanSet) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for (scope, groups) in orphans.iter() {
            let listed = match self.api.list_in_scope(scope).await {
                Ok(listed) => listed,
                Err(e) => {
                    tracing::warn!(%scope, error = %e, "could not list secondary resources");
                    report.failures.push(ReconcileFailure {
                        scope: scope.clone(),
                        name: None,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let matched: Vec<SecondaryResource> = listed
                .into_iter()
                .filter(|resource| {
                    self.naming
                        .group_of(&resource.name)
                        .is_some_and(|group| groups.contains(&group))
                })
                .collect();

            tracing::info!(
                %scope,
                groups = ?groups,
                matched = matched.len(),
                "deleting orphaned secondary resources"
            );

            let results = join_all(matched.iter().map(|resource| self.api.delete(resource))).await;
            let mut kept = Vec::new();

            for (resource, result) in matched.into_iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        tracing::debug!(name = %resource.name, %scope, "already gone");
                    }
                    Err(e) => {
                        tracing::warn!(
                            kind = %resource.kind,
                            name = %resource.name,
                            %scope,
                            error = %e,
                            "failed to delete orphaned resource"
                        );
                        report.failures.push(ReconcileFailure {
                            scope: scope.clone(),
                            name: Some(resource.name.clone()),
                            error: e.to_string(),
                        });
                        kept.push((resource.kind, resource.key()));
                        continue;
                    }
                }
                self.caches.invalidate(resource.kind, &resource.key());
                report.deleted.push(resource);
            }

            self.forget_unlisted(scope, groups, &kept);
        }

        report
    }

    /// Evict cached entries of orphaned groups the listing did not show.
    ///
    /// Entries in `kept` still exist remotely and stay.
    fn forget_unlisted(
        &self,
        scope: &str,
        groups: &BTreeSet<String>,
        kept: &[(SecondaryKind, ScopedName)],
    ) {
        for kind in [SecondaryKind::KeyPair, SecondaryKind::SecurityGroup] {
            for key in self.caches.keys_in_scope(kind, scope) {
                let orphaned = self
                    .naming
                    .group_of(&key.name)
                    .is_some_and(|group| groups.contains(&group));
                if !orphaned || kept.iter().any(|(k, name)| *k == kind && *name == key) {
                    continue;
                }
                if self.caches.invalidate(kind, &key) {
                    tracing::debug!(%kind, name = %key.name, %scope, "evicted entry missing remotely");
                }
            }
        }
    }
}
