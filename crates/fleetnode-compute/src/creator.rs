//! Create-or-find for uniquely named resources
//!
//! A create can lose a race against another actor creating the same name.
//! The provider reports that as a conflict; we then look the name up, and
//! if the winner is not visible yet we go around again, up to a bound.

use crate::error::{ComputeError, Result};
use crate::resource::ScopedName;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry configuration for conflicting creations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of create/find cycles
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// State of one create/find cycle
#[derive(Debug)]
enum Attempt<V> {
    Success(V),
    /// Someone else owns the name but we cannot see their resource yet
    Conflict,
}

/// Result of the whole retry sequence
#[derive(Debug)]
pub enum Resolution<V> {
    Created(V),
    /// The name was taken; this is the existing resource
    Found(V),
    Exhausted { attempts: u32 },
}

/// Runs create/find cycles under a [`RetryConfig`]
#[derive(Debug, Clone, Default)]
pub struct ConflictRetryingCreator {
    config: RetryConfig,
}

impl ConflictRetryingCreator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Create the resource named by `key`, or return the one that beat us.
    ///
    /// Errors other than a conflict abort immediately. Running out of
    /// attempts yields [`ComputeError::CreationRaceUnresolved`].
    pub async fn create_or_find<V, C, CFut, F, FFut>(
        &self,
        key: &ScopedName,
        create: C,
        find: F,
    ) -> Result<V>
    where
        C: Fn() -> CFut,
        CFut: Future<Output = Result<V>>,
        F: Fn() -> FFut,
        FFut: Future<Output = Result<Option<V>>>,
    {
        match self.resolve(key, create, find).await? {
            Resolution::Created(value) | Resolution::Found(value) => Ok(value),
            Resolution::Exhausted { attempts } => {
                tracing::error!(key = %key, attempts, "creation race unresolved");
                Err(ComputeError::CreationRaceUnresolved {
                    key: key.clone(),
                    attempts,
                })
            }
        }
    }

    /// Same as [`create_or_find`](Self::create_or_find) but reports how the
    /// resource was obtained instead of failing on exhaustion.
    pub async fn resolve<V, C, CFut, F, FFut>(
        &self,
        key: &ScopedName,
        create: C,
        find: F,
    ) -> Result<Resolution<V>>
    where
        C: Fn() -> CFut,
        CFut: Future<Output = Result<V>>,
        F: Fn() -> FFut,
        FFut: Future<Output = Result<Option<V>>>,
    {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 0..max_attempts {
            match create().await {
                Ok(value) => {
                    tracing::debug!(key = %key, attempt = attempt + 1, "created");
                    return Ok(Resolution::Created(value));
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(key = %key, attempt = attempt + 1, "name taken, looking it up");
                }
                Err(e) => return Err(e),
            }

            let state = match find().await? {
                Some(existing) => Attempt::Success(existing),
                None => Attempt::Conflict,
            };

            match state {
                Attempt::Success(existing) => {
                    tracing::info!(key = %key, "reusing resource created concurrently");
                    return Ok(Resolution::Found(existing));
                }
                Attempt::Conflict => {
                    tracing::warn!(
                        key = %key,
                        attempt = attempt + 1,
                        max_attempts,
                        "conflicting resource not visible yet"
                    );
                }
            }

            if attempt + 1 < max_attempts {
                sleep(self.config.delay_for_attempt(attempt)).await;
            }
        }

        Ok(Resolution::Exhausted {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn key() -> ScopedName {
        ScopedName::new("tk1a", "fleet-web")
    }

    fn creator(max_attempts: u32) -> ConflictRetryingCreator {
        ConflictRetryingCreator::new(RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_then_found() {
        let creates = AtomicU32::new(0);
        let creates = &creates;

        let value = creator(3)
            .create_or_find(
                &key(),
                || async move {
                    creates.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(ComputeError::CreationConflict("fleet-web".into()))
                },
                || async { Ok(Some("existing".to_string())) },
            )
            .await
            .unwrap();

        assert_eq!(value, "existing");
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_conflicting_resource_is_visible() {
        let finds = AtomicU32::new(0);
        let finds = &finds;
        let creates = AtomicU32::new(0);
        let creates = &creates;

        let resolution = creator(5)
            .resolve(
                &key(),
                || async move {
                    creates.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(ComputeError::CreationConflict("fleet-web".into()))
                },
                || async move {
                    let n = finds.fetch_add(1, Ordering::SeqCst);
                    Ok((n == 2).then(|| "late".to_string()))
                },
            )
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::Found(ref v) if v == "late"));
        assert_eq!(creates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_a_distinct_error() {
        let err = creator(2)
            .create_or_find(
                &key(),
                || async { Err::<String, _>(ComputeError::CreationConflict("fleet-web".into())) },
                || async { Ok(None) },
            )
            .await
            .unwrap_err();

        match err {
            ComputeError::CreationRaceUnresolved { key: k, attempts } => {
                assert_eq!(k, key());
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let creates = AtomicU32::new(0);
        let creates = &creates;

        let err = creator(5)
            .create_or_find(
                &key(),
                || async move {
                    creates.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(ComputeError::Transport("connection refused".into()))
                },
                || async { Ok(None) },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ComputeError::Transport(_)));
        assert_eq!(creates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(2));
    }
}
