//! Convergence loop: poll a resource until it reaches a status
//!
//! Waits are `tokio::time::sleep` raced against a [`CancellationToken`],
//! so thousands of outstanding polls cost no threads.

use crate::error::{ComputeError, Result};
use crate::predicate::StatusPredicate;
use crate::provider::RefreshableResource;
use crate::resource::{ResourceRef, Status, StatusfulResource};
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Lower bound for the sleep between two checks
pub const MIN_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Poll schedule (capped exponential backoff)
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Sleep after the first check
    pub initial_period: Duration,
    /// Upper bound of the sleep between checks
    pub max_period: Duration,
    /// Growth factor of the sleep; 1.0 polls at a fixed interval
    pub multiplier: f64,
    /// Total time budget of one wait
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_period: Duration::from_millis(50),
            max_period: Duration::from_secs(1),
            multiplier: 1.5,
            max_wait: Duration::from_secs(1200),
        }
    }
}

impl PollConfig {
    /// Poll every `period` until `max_wait` elapses
    pub fn fixed(period: Duration, max_wait: Duration) -> Self {
        Self {
            initial_period: period,
            max_period: period,
            multiplier: 1.0,
            max_wait,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sleep before check number `attempt + 1`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_period.as_millis() as f64 * factor;
        let capped = millis.min(self.max_period.as_millis() as f64);
        Duration::from_millis(capped as u64).max(MIN_POLL_PERIOD)
    }
}

/// How a wait ended
#[derive(Debug, Clone)]
pub enum Outcome<S> {
    /// Target reached. `None` when the resource disappeared and the
    /// predicate accepts deletion.
    Converged(Option<StatusfulResource<S>>),
    TimedOut {
        last: Option<StatusfulResource<S>>,
        waited: Duration,
    },
    Invalid {
        resource: ResourceRef,
        status: String,
    },
    Cancelled {
        last: Option<StatusfulResource<S>>,
    },
}

impl<S: Status> Outcome<S> {
    pub fn is_converged(&self) -> bool {
        matches!(self, Outcome::Converged(_))
    }

    /// Convert to a `Result`, turning every non-converged outcome into the
    /// matching [`ComputeError`].
    pub fn into_result(
        self,
        reference: &ResourceRef,
        target: S,
    ) -> Result<Option<StatusfulResource<S>>> {
        match self {
            Outcome::Converged(latest) => Ok(latest),
            Outcome::TimedOut { waited, .. } => Err(ComputeError::TimedOut {
                resource: reference.clone(),
                target: target.to_string(),
                waited,
            }),
            Outcome::Invalid { resource, status } => {
                Err(ComputeError::InvalidTerminalStatus { resource, status })
            }
            Outcome::Cancelled { .. } => Err(ComputeError::Cancelled {
                resource: reference.clone(),
            }),
        }
    }
}

/// Repeats a [`StatusPredicate`] until it holds, fails, or time runs out
#[derive(Debug, Clone)]
pub struct ConvergenceLoop<S: Status> {
    predicate: StatusPredicate<S>,
    config: PollConfig,
}

impl<S: Status> ConvergenceLoop<S> {
    pub fn new(predicate: StatusPredicate<S>, config: PollConfig) -> Self {
        Self { predicate, config }
    }

    pub fn predicate(&self) -> &StatusPredicate<S> {
        &self.predicate
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Wait for `reference` to converge.
    ///
    /// `cached` is the caller's last observation, if any; it is checked
    /// before the provider is asked. Transport errors count as a non-match
    /// and consume the time budget like any other check. A check that has
    /// not returned is dropped once the budget runs out or `cancel` fires.
    pub async fn run<R>(
        &self,
        source: &R,
        reference: &ResourceRef,
        cached: Option<StatusfulResource<S>>,
        cancel: &CancellationToken,
    ) -> Outcome<S>
    where
        R: RefreshableResource<S> + ?Sized,
    {
        let start = Instant::now();
        let target = self.predicate.target();
        let mut latest = cached;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                tracing::debug!(resource = %reference, %target, "wait cancelled");
                return Outcome::Cancelled { last: latest };
            }

            let remaining = self.config.max_wait.saturating_sub(start.elapsed());
            let checked = tokio::select! {
                _ = cancel.cancelled() => None,
                checked = timeout(
                    remaining,
                    self.predicate.check(source, reference, latest.as_ref()),
                ) => Some(checked),
            };
            let checked = match checked {
                None => {
                    tracing::debug!(resource = %reference, %target, "wait cancelled during check");
                    return Outcome::Cancelled { last: latest };
                }
                Some(Err(_)) => return self.timed_out(reference, latest, start.elapsed()),
                Some(Ok(checked)) => checked,
            };

            match checked {
                Ok(check) if check.matched => {
                    tracing::debug!(
                        resource = %reference,
                        %target,
                        attempts = attempt + 1,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "converged"
                    );
                    // the observation that matched, even if an older-looking one is cached
                    return Outcome::Converged(check.latest);
                }
                Ok(check) => {
                    if let Some(fresh) = check.latest {
                        latest = Some(match latest.take() {
                            Some(previous) => previous.freshest(fresh),
                            None => fresh,
                        });
                    }
                }
                Err(ComputeError::InvalidTerminalStatus { resource, status }) => {
                    tracing::warn!(
                        resource = %resource,
                        scope = %resource.scope,
                        %status,
                        %target,
                        "resource reached an invalid status"
                    );
                    return Outcome::Invalid { resource, status };
                }
                Err(e) => {
                    tracing::warn!(
                        resource = %reference,
                        %target,
                        attempt = attempt + 1,
                        error = %e,
                        "status check failed, will retry"
                    );
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= self.config.max_wait {
                return self.timed_out(reference, latest, elapsed);
            }

            let delay = self
                .config
                .delay_for_attempt(attempt)
                .min(self.config.max_wait - elapsed);
            attempt = attempt.saturating_add(1);

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(resource = %reference, %target, "wait cancelled");
                    return Outcome::Cancelled { last: latest };
                }
                _ = sleep(delay) => {}
            }
        }
    }

    fn timed_out(
        &self,
        reference: &ResourceRef,
        last: Option<StatusfulResource<S>>,
        waited: Duration,
    ) -> Outcome<S> {
        tracing::warn!(
            resource = %reference,
            scope = %reference.scope,
            target = %self.predicate.target(),
            last_status = ?last.as_ref().map(|r| r.status),
            waited_ms = waited.as_millis() as u64,
            "timed out waiting for status"
        );
        Outcome::TimedOut { last, waited }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NodeStatus;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays a status script; the last entry repeats forever.
    struct Script {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
    }

    #[derive(Clone, Copy)]
    enum Step {
        Status(NodeStatus),
        Gone,
        Fail,
    }

    impl Script {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn statuses(statuses: &[NodeStatus]) -> Self {
            Self::new(statuses.iter().copied().map(Step::Status).collect())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshableResource<NodeStatus> for Script {
        async fn refresh(
            &self,
            reference: &ResourceRef,
        ) -> Result<Option<StatusfulResource<NodeStatus>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = {
                let mut steps = self.steps.lock().unwrap();
                if steps.len() > 1 {
                    steps.pop_front()
                } else {
                    steps.front().copied()
                }
            };
            match step {
                Some(Step::Status(status)) => {
                    Ok(Some(StatusfulResource::new(reference.clone(), status)))
                }
                Some(Step::Fail) => Err(ComputeError::Transport("connection reset".into())),
                Some(Step::Gone) | None => Ok(None),
            }
        }
    }

    /// Never answers within any test's budget.
    struct Hanging;

    #[async_trait]
    impl RefreshableResource<NodeStatus> for Hanging {
        async fn refresh(
            &self,
            _reference: &ResourceRef,
        ) -> Result<Option<StatusfulResource<NodeStatus>>> {
            sleep(Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    /// Answers `Running`, stamped a minute in the past.
    struct Backdated;

    #[async_trait]
    impl RefreshableResource<NodeStatus> for Backdated {
        async fn refresh(
            &self,
            reference: &ResourceRef,
        ) -> Result<Option<StatusfulResource<NodeStatus>>> {
            Ok(Some(
                StatusfulResource::new(reference.clone(), NodeStatus::Running)
                    .observed_at(chrono::Utc::now() - chrono::Duration::seconds(60)),
            ))
        }
    }

    fn node() -> ResourceRef {
        ResourceRef::new("us-1", "i-123")
    }

    fn assert_about(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(100),
            "expected about {expected:?}, got {actual:?}"
        );
    }

    fn running_loop() -> ConvergenceLoop<NodeStatus> {
        ConvergenceLoop::new(
            StatusPredicate::new(NodeStatus::Running, [NodeStatus::Error]),
            PollConfig::fixed(Duration::from_secs(1), Duration::from_secs(30)),
        )
    }

    #[test]
    fn test_delay_calculation() {
        let config = PollConfig {
            initial_period: Duration::from_millis(1000),
            max_period: Duration::from_millis(10000),
            multiplier: 2.0,
            max_wait: Duration::from_secs(60),
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
    }

    #[test]
    fn test_delay_never_below_minimum() {
        let config = PollConfig::fixed(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(0), MIN_POLL_PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_on_third_poll() {
        let source = Script::statuses(&[
            NodeStatus::Pending,
            NodeStatus::Pending,
            NodeStatus::Running,
        ]);
        let start = Instant::now();

        let outcome = running_loop()
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        match outcome {
            Outcome::Converged(Some(latest)) => assert_eq!(latest.status, NodeStatus::Running),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_about(start.elapsed(), Duration::from_secs(2));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_status_stops_polling() {
        let source = Script::statuses(&[NodeStatus::Pending, NodeStatus::Error]);
        let start = Instant::now();

        let outcome = running_loop()
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        match outcome {
            Outcome::Invalid { resource, status } => {
                assert_eq!(resource, node());
                assert_eq!(status, "error");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_about(start.elapsed(), Duration::from_secs(1));
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_refresh_match_returns_immediately() {
        let source = Script::statuses(&[NodeStatus::Running]);

        let outcome = running_loop()
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        assert!(outcome.is_converged());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_and_keeps_last_observation() {
        let source = Script::statuses(&[NodeStatus::Pending]);
        let start = Instant::now();

        let outcome = running_loop()
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        match outcome {
            Outcome::TimedOut { last, waited } => {
                assert_eq!(last.unwrap().status, NodeStatus::Pending);
                assert_about(waited, Duration::from_secs(30));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_about(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_consume_budget_then_recover() {
        let source = Script::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Status(NodeStatus::Running),
        ]);

        let outcome = running_loop()
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        assert!(outcome.is_converged());
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_a_timeout() {
        let source = Script::statuses(&[NodeStatus::Pending]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(4500)).await;
            trigger.cancel();
        });

        let outcome = running_loop().run(&source, &node(), None, &cancel).await;

        assert!(matches!(outcome, Outcome::Cancelled { .. }));
        // polls at t=0..=4, none after the cancel at 4.5s
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_resource_converges_when_accepted() {
        let source = Script::new(vec![Step::Status(NodeStatus::Stopping), Step::Gone]);
        let waiter = ConvergenceLoop::new(
            StatusPredicate::true_if_deleted(NodeStatus::Terminated, []),
            PollConfig::fixed(Duration::from_secs(1), Duration::from_secs(30)),
        );

        let outcome = waiter
            .run(&source, &node(), None, &CancellationToken::new())
            .await;

        assert!(matches!(outcome, Outcome::Converged(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_refresh_is_cut_off_at_max_wait() {
        let start = Instant::now();

        let outcome = running_loop()
            .run(&Hanging, &node(), None, &CancellationToken::new())
            .await;

        match outcome {
            Outcome::TimedOut { last, waited } => {
                assert!(last.is_none());
                assert_about(waited, Duration::from_secs(30));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_about(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_hung_refresh() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let start = Instant::now();

        let outcome = running_loop().run(&Hanging, &node(), None, &cancel).await;

        assert!(matches!(outcome, Outcome::Cancelled { last: None }));
        assert_about(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_converged_carries_matching_observation_despite_clock_skew() {
        let cached = StatusfulResource::new(node(), NodeStatus::Pending);

        let outcome = running_loop()
            .run(&Backdated, &node(), Some(cached), &CancellationToken::new())
            .await;

        match outcome {
            Outcome::Converged(Some(latest)) => assert_eq!(latest.status, NodeStatus::Running),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
