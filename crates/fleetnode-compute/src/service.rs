//! Node orchestration on top of the convergence engine

use crate::convergence::{ConvergenceLoop, PollConfig};
use crate::creator::{ConflictRetryingCreator, RetryConfig};
use crate::error::{ComputeError, ReconcileFailure, Result, RunNodesFailure};
use crate::naming::GroupNamingConvention;
use crate::node::{NodeMetadata, NodeSpec, NodeTemplate};
use crate::predicate::StatusPredicate;
use crate::provider::{ComputeProvider, KeyPair, RefreshableResource, SecondaryResource, SecurityGroup};
use crate::reconcile::{OrphanReconciler, OrphanSet, SecondaryCaches};
use crate::resource::{ImageStatus, NodeStatus, ResourceRef, ScopedName, StatusfulResource};
use futures_util::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

/// Period between destroy attempts the provider refused
const DESTROY_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Per-kind wait budgets
#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub node_running: Duration,
    pub node_terminated: Duration,
    pub image_available: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            node_running: Duration::from_secs(1200),
            node_terminated: Duration::from_secs(30),
            image_available: Duration::from_secs(1200),
        }
    }
}

/// Everything tunable about a [`ComputeService`]
#[derive(Debug, Clone)]
pub struct ComputeSettings {
    pub timeouts: Timeouts,
    /// Poll schedule; `max_wait` is replaced by the matching timeout
    pub poll: PollConfig,
    pub retry: RetryConfig,
    pub naming: GroupNamingConvention,
    /// Upper bound on node creations/destructions running at once
    pub max_concurrency: usize,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            poll: PollConfig::default(),
            retry: RetryConfig::default(),
            naming: GroupNamingConvention::default(),
            max_concurrency: 8,
        }
    }
}

/// Result of destroying a batch of nodes
#[derive(Debug, Default)]
pub struct DestroyResult {
    pub destroyed: Vec<NodeMetadata>,
    /// Nodes that could not be destroyed, with the reason
    pub failed: Vec<(NodeMetadata, String)>,
    /// Secondary resources removed because their group is gone
    pub orphans_deleted: Vec<SecondaryResource>,
    pub reconcile_failures: Vec<ReconcileFailure>,
    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl DestroyResult {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.reconcile_failures.is_empty()
    }
}

/// Provider-independent node lifecycle
pub struct ComputeService {
    provider: Arc<dyn ComputeProvider>,
    settings: ComputeSettings,
    creator: ConflictRetryingCreator,
    caches: SecondaryCaches,
}

impl ComputeService {
    pub fn new(provider: Arc<dyn ComputeProvider>, settings: ComputeSettings) -> Self {
        let creator = ConflictRetryingCreator::new(settings.retry.clone());
        Self {
            provider,
            settings,
            creator,
            caches: SecondaryCaches::new(),
        }
    }

    pub fn provider(&self) -> &dyn ComputeProvider {
        self.provider.as_ref()
    }

    pub fn settings(&self) -> &ComputeSettings {
        &self.settings
    }

    pub fn caches(&self) -> &SecondaryCaches {
        &self.caches
    }

    fn poll_config(&self, max_wait: Duration) -> PollConfig {
        self.settings.poll.clone().with_max_wait(max_wait)
    }

    /// Keypair shared by `group` in `scope`, created on first use
    pub async fn key_pair_for_group(&self, scope: &str, group: &str) -> Result<KeyPair> {
        let provider = self.provider.as_ref();
        let name = self.settings.naming.shared_name_for_group(group);
        let key = ScopedName::new(scope, name.as_str());
        let (name, key_ref) = (name.as_str(), &key);

        self.caches
            .key_pairs
            .get_or_create(&key, move || {
                self.creator.create_or_find(
                    key_ref,
                    move || provider.create_key_pair(scope, name),
                    move || provider.find_key_pair(scope, name),
                )
            })
            .await
    }

    /// Security group shared by `group` in `scope`, created on first use
    pub async fn security_group_for_group(
        &self,
        scope: &str,
        group: &str,
        inbound_ports: &[u16],
    ) -> Result<SecurityGroup> {
        let provider = self.provider.as_ref();
        let name = self.settings.naming.shared_name_for_group(group);
        let key = ScopedName::new(scope, name.as_str());
        let (name, key_ref) = (name.as_str(), &key);

        self.caches
            .security_groups
            .get_or_create(&key, move || {
                self.creator.create_or_find(
                    key_ref,
                    move || provider.create_security_group(scope, name, inbound_ports),
                    move || provider.find_security_group(scope, name),
                )
            })
            .await
    }

    /// Create `count` nodes in `group` and wait until all of them run.
    ///
    /// Any node failing to create or converge turns the call into
    /// [`ComputeError::RunNodes`], which still carries the good nodes.
    pub async fn create_nodes_in_group(
        &self,
        group: &str,
        count: usize,
        template: &NodeTemplate,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeMetadata>> {
        self.settings.naming.validate_group(group)?;
        if count == 0 {
            return Ok(Vec::new());
        }
        tracing::info!(
            group,
            count,
            scope = %template.scope,
            provider = self.provider.name(),
            "creating nodes"
        );

        let key_pair = self.key_pair_for_group(&template.scope, group).await?;
        let security_group = self
            .security_group_for_group(&template.scope, group, &template.inbound_ports)
            .await?;

        let specs: Vec<NodeSpec> = (0..count)
            .map(|_| NodeSpec {
                scope: template.scope.clone(),
                name: self.settings.naming.unique_name_for_group(group),
                group: group.to_string(),
                image: template.image.clone(),
                plan: template.plan.clone(),
                key_pair: Some(key_pair.name.clone()),
                security_group: Some(security_group.name.clone()),
            })
            .collect();

        let results: Vec<(String, Result<NodeMetadata>)> = stream::iter(specs)
            .map(|spec| async move {
                let name = spec.name.clone();
                (name, self.create_and_await(spec, cancel).await)
            })
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let mut good = Vec::new();
        let mut failed = Vec::new();
        for (name, result) in results {
            match result {
                Ok(node) => good.push(node),
                Err(e) => {
                    tracing::warn!(group, node = %name, error = %e, "node failed");
                    failed.push((name, e));
                }
            }
        }

        tracing::info!(group, good = good.len(), failed = failed.len(), "nodes created");
        if failed.is_empty() {
            Ok(good)
        } else {
            Err(ComputeError::RunNodes(Box::new(RunNodesFailure {
                group: group.to_string(),
                requested: count,
                good,
                failed,
            })))
        }
    }

    async fn create_and_await(
        &self,
        spec: NodeSpec,
        cancel: &CancellationToken,
    ) -> Result<NodeMetadata> {
        let created = self.provider.create_node(&spec).await?;
        let reference = created.reference.clone();
        tracing::debug!(node = %reference, name = %spec.name, "node requested");

        let running = self
            .wait_for_node(&reference, NodeStatus::Running, Some(created), cancel)
            .await?;

        Ok(NodeMetadata {
            public_address: self.provider.public_address(&running),
            reference,
            name: spec.name,
            group: Some(spec.group),
            status: running.status,
        })
    }

    /// Wait for a node to reach `target`.
    ///
    /// Waiting for `terminated` also accepts the node disappearing, in which
    /// case a synthetic terminated observation is returned.
    pub async fn wait_for_node(
        &self,
        reference: &ResourceRef,
        target: NodeStatus,
        cached: Option<StatusfulResource<NodeStatus>>,
        cancel: &CancellationToken,
    ) -> Result<StatusfulResource<NodeStatus>> {
        let timeouts = &self.settings.timeouts;
        let (predicate, max_wait) = match target {
            NodeStatus::Terminated => (
                StatusPredicate::true_if_deleted(target, [NodeStatus::Error]),
                timeouts.node_terminated,
            ),
            NodeStatus::Running => (
                StatusPredicate::new(target, [NodeStatus::Error, NodeStatus::Terminated]),
                timeouts.node_running,
            ),
            _ => (
                StatusPredicate::new(target, [NodeStatus::Error]),
                timeouts.node_running,
            ),
        };

        let latest = ConvergenceLoop::new(predicate, self.poll_config(max_wait))
            .run(self.provider.as_ref(), reference, cached, cancel)
            .await
            .into_result(reference, target)?;

        Ok(latest.unwrap_or_else(|| StatusfulResource::new(reference.clone(), target)))
    }

    /// Wait for an image to become active
    pub async fn wait_for_image<R>(
        &self,
        source: &R,
        reference: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<StatusfulResource<ImageStatus>>
    where
        R: RefreshableResource<ImageStatus> + ?Sized,
    {
        let predicate = StatusPredicate::new(ImageStatus::Active, [ImageStatus::Error]);
        let latest = ConvergenceLoop::new(
            predicate,
            self.poll_config(self.settings.timeouts.image_available),
        )
        .run(source, reference, None, cancel)
        .await
        .into_result(reference, ImageStatus::Active)?;

        latest.ok_or_else(|| ComputeError::ResourceNotFound(reference.to_string()))
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeMetadata>> {
        self.provider.list_nodes().await
    }

    /// Nodes belonging to `group`
    pub async fn list_nodes_in_group(&self, group: &str) -> Result<Vec<NodeMetadata>> {
        Ok(self
            .provider
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| node.group.as_deref() == Some(group))
            .collect())
    }

    /// Destroy one node and clean up its group if it was the last one
    pub async fn destroy_node(
        &self,
        reference: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<DestroyResult> {
        self.destroy_nodes_matching(|node| &node.reference == reference, cancel)
            .await
    }

    /// Destroy every live node accepted by `filter`, then delete the
    /// secondary resources of groups left without live nodes.
    pub async fn destroy_nodes_matching<F>(
        &self,
        filter: F,
        cancel: &CancellationToken,
    ) -> Result<DestroyResult>
    where
        F: Fn(&NodeMetadata) -> bool,
    {
        let start = std::time::Instant::now();
        let targets: Vec<NodeMetadata> = self
            .provider
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| node.is_live() && filter(node))
            .collect();

        tracing::info!(count = targets.len(), "destroying nodes");

        let outcomes: Vec<(NodeMetadata, Result<()>)> = stream::iter(targets)
            .map(|node| async move {
                let result = self.destroy_one(&node.reference, cancel).await;
                (node, result)
            })
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        let mut result = DestroyResult::default();
        for (node, outcome) in outcomes {
            match outcome {
                Ok(()) => result.destroyed.push(node),
                Err(e) => {
                    tracing::warn!(node = %node.reference, error = %e, "failed to destroy node");
                    result.failed.push((node, e.to_string()));
                }
            }
        }

        if !result.destroyed.is_empty() {
            let orphans = match self.orphans_of(&result.destroyed, &result.failed).await {
                Ok(orphans) => orphans,
                Err(e) => {
                    // the nodes are gone either way; report the skipped cleanup
                    tracing::warn!(error = %e, "could not list nodes, skipping orphan cleanup");
                    let scopes: BTreeSet<&str> = result
                        .destroyed
                        .iter()
                        .map(|node| node.reference.scope.as_str())
                        .collect();
                    result.reconcile_failures = scopes
                        .into_iter()
                        .map(|scope| ReconcileFailure {
                            scope: scope.to_string(),
                            name: None,
                            error: e.to_string(),
                        })
                        .collect();
                    OrphanSet::new()
                }
            };
            if !orphans.is_empty() {
                let report = OrphanReconciler::new(
                    self.provider.as_ref(),
                    &self.settings.naming,
                    &self.caches,
                )
                .reconcile(&orphans)
                .await;
                result.orphans_deleted = report.deleted;
                result.reconcile_failures = report.failures;
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            destroyed = result.destroyed.len(),
            failed = result.failed.len(),
            orphans_deleted = result.orphans_deleted.len(),
            "destroy finished"
        );
        Ok(result)
    }

    /// Groups of `destroyed` with no live node left, judged by a fresh listing
    async fn orphans_of(
        &self,
        destroyed: &[NodeMetadata],
        failed: &[(NodeMetadata, String)],
    ) -> Result<OrphanSet> {
        let mut remaining: Vec<NodeMetadata> = self
            .provider
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| !destroyed.iter().any(|d| d.reference == node.reference))
            .collect();
        remaining.extend(failed.iter().map(|(node, _)| node.clone()));

        Ok(OrphanSet::from_destroyed(destroyed, &remaining))
    }

    async fn destroy_one(&self, reference: &ResourceRef, cancel: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + self.settings.timeouts.node_terminated;

        loop {
            match self.provider.destroy_node(reference).await {
                Ok(()) => break,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(node = %reference, "node already gone");
                    return Ok(());
                }
                Err(ComputeError::IllegalState(reason)) if Instant::now() < deadline => {
                    tracing::warn!(node = %reference, %reason, "illegal state destroying node, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(ComputeError::Cancelled { resource: reference.clone() });
                        }
                        _ = sleep(DESTROY_RETRY_PERIOD) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.wait_for_node(reference, NodeStatus::Terminated, None, cancel)
            .await?;
        tracing::debug!(node = %reference, "destroyed");
        Ok(())
    }
}
