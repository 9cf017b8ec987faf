//! Bounded polling of eventually-consistent predicates.
//!
//! Asynchronous side effects (queue consumption, change-data-capture, cache
//! rebuilds) are observed by re-evaluating a predicate at a fixed interval
//! until it holds or the deadline passes. Timing out is an expected result
//! ([`Convergence::TimedOut`]); only a persistently broken observation channel
//! or cancellation is an error.

use crate::{
    count_for, reconcile, CollaboratorError, Error, Identifier, KeyValueObserver, Result,
    RowFilter, ShardStrategy, ShardedRowCounter, TemplateHandle,
};
use core::{future::Future, time::Duration};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

/// Interval and deadline the key-value store is polled with by default.
pub const KV_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const KV_POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval and deadline persisted rows are polled with by default.
pub const ROW_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const ROW_POLL_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive observation failures tolerated by default.
pub const DEFAULT_ERROR_BUDGET: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
    /// Upper bound on predicate evaluations, on top of the deadline.
    pub max_attempts: Option<u32>,
    /// Consecutive observation errors tolerated before giving up.
    pub error_budget: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_attempts: None,
            error_budget: DEFAULT_ERROR_BUDGET,
        }
    }

    /// Policy for key-value observations.
    pub const fn key_value() -> Self {
        Self::new(KV_POLL_INTERVAL, KV_POLL_TIMEOUT)
    }

    /// Policy for persisted row counts.
    pub const fn persistence() -> Self {
        Self::new(ROW_POLL_INTERVAL, ROW_POLL_TIMEOUT)
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    #[must_use]
    pub const fn with_error_budget(mut self, error_budget: u32) -> Self {
        self.error_budget = error_budget;
        self
    }

    /// # Errors
    ///
    /// [`Error::InvalidConfig`] if the interval is zero, longer than the
    /// timeout, or `max_attempts` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("poll interval must be greater than 0"));
        }
        if self.interval > self.timeout {
            return Err(Error::config(format!(
                "poll interval {:?} exceeds poll timeout {:?}",
                self.interval, self.timeout
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::config("poll max attempts must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::key_value()
    }
}

/// How a poll ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Convergence {
    Converged {
        elapsed: Duration,
        attempts: u32,
    },
    TimedOut {
        elapsed: Duration,
        attempts: u32,
        /// Most recent observation error, if any evaluation failed.
        last_error: Option<CollaboratorError>,
    },
}

impl Convergence {
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Converged { elapsed, .. } | Self::TimedOut { elapsed, .. } => *elapsed,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Converged { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
        }
    }

    /// Returns the time to convergence.
    ///
    /// # Errors
    ///
    /// [`Error::NotConverged`] naming `signal` if the poll timed out.
    pub fn into_result(self, signal: &str) -> Result<Duration> {
        match self {
            Self::Converged { elapsed, .. } => Ok(elapsed),
            Self::TimedOut {
                elapsed, attempts, ..
            } => Err(Error::NotConverged {
                signal: signal.to_string(),
                waited: elapsed,
                attempts,
            }),
        }
    }
}

/// Evaluates predicates under a [`PollPolicy`].
#[derive(Clone, Debug)]
pub struct Poller {
    policy: PollPolicy,
    cancel: CancellationToken,
}

impl Poller {
    /// # Errors
    ///
    /// Returns the policy's validation error.
    pub fn new(policy: PollPolicy, cancel: CancellationToken) -> Result<Self> {
        policy.validate()?;
        Ok(Self { policy, cancel })
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Polls `predicate` until it returns `true`, the deadline passes, or the
    /// attempt cap is reached.
    ///
    /// The last sleep is clamped to the time remaining, so an effect that
    /// completes at `D < timeout` is observed by `D + interval`.
    ///
    /// # Errors
    ///
    /// - [`Error::ObservationFailed`] when more than `error_budget`
    ///   consecutive evaluations fail.
    /// - [`Error::Cancelled`] when the token fires.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip(self, predicate)))]
    pub async fn await_convergence<F, Fut>(
        &self,
        signal: &str,
        mut predicate: F,
    ) -> Result<Convergence>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = core::result::Result<bool, CollaboratorError>>,
    {
        let started = Instant::now();
        let deadline = started + self.policy.timeout;
        let mut attempts = 0_u32;
        let mut streak = 0_u32;
        let mut last_error = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            attempts += 1;
            let evaluation = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                evaluation = timeout_at(deadline, predicate()) => evaluation,
            };
            let Ok(evaluation) = evaluation else {
                #[cfg(feature = "tracing")]
                tracing::warn!("`{signal}` was still being observed at the deadline");
                return Ok(Convergence::TimedOut {
                    elapsed: started.elapsed(),
                    attempts,
                    last_error,
                });
            };
            match evaluation {
                Ok(true) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("`{signal}` converged after {attempts} polls");
                    return Ok(Convergence::Converged {
                        elapsed: started.elapsed(),
                        attempts,
                    });
                }
                Ok(false) => streak = 0,
                Err(e) => {
                    streak += 1;
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Observing `{signal}` failed ({streak} in a row): {e}");
                    if streak > self.policy.error_budget {
                        return Err(Error::ObservationFailed {
                            signal: signal.to_string(),
                            failures: streak,
                            source: e,
                        });
                    }
                    last_error = Some(e);
                }
            }

            let now = Instant::now();
            let capped = self.policy.max_attempts.is_some_and(|max| attempts >= max);
            if now >= deadline || capped {
                #[cfg(feature = "tracing")]
                tracing::warn!("`{signal}` did not converge after {attempts} polls");
                return Ok(Convergence::TimedOut {
                    elapsed: started.elapsed(),
                    attempts,
                    last_error,
                });
            }

            let nap = self.policy.interval.min(deadline - now);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                () = sleep(nap) => {}
            }
        }
    }

    /// Polls a named [`ConvergenceSignal`].
    ///
    /// # Errors
    ///
    /// Same as [`await_convergence`](Self::await_convergence).
    pub async fn await_signal<S>(&self, signal: &S) -> Result<Convergence>
    where
        S: ConvergenceSignal,
    {
        self.await_convergence(&signal.name(), move || signal.observe())
            .await
    }
}

/// A named predicate over external state. Owns no data beyond its accessor.
pub trait ConvergenceSignal: Send + Sync {
    fn name(&self) -> String;

    fn observe(&self) -> impl Future<Output = core::result::Result<bool, CollaboratorError>> + Send;
}

/// Holds once `key` exists in the key-value store.
pub struct KeyExists<'a, K> {
    observer: &'a K,
    key: String,
}

impl<'a, K: KeyValueObserver> KeyExists<'a, K> {
    pub fn new(observer: &'a K, key: impl Into<String>) -> Self {
        Self {
            observer,
            key: key.into(),
        }
    }
}

impl<K: KeyValueObserver> ConvergenceSignal for KeyExists<'_, K> {
    fn name(&self) -> String {
        format!("key {} exists", self.key)
    }

    fn observe(&self) -> impl Future<Output = core::result::Result<bool, CollaboratorError>> + Send {
        self.observer.exists(&self.key)
    }
}

/// Holds once the cross-shard row total reaches `expected`.
///
/// Unreachable shards are skipped, as in [`reconcile`]; if none are
/// reachable the observation fails.
pub struct ReconciledTotal<'a, C> {
    counter: &'a C,
    filter: RowFilter,
    expected: u64,
}

impl<'a, C: ShardedRowCounter> ReconciledTotal<'a, C> {
    pub fn new(counter: &'a C, filter: RowFilter, expected: u64) -> Self {
        Self {
            counter,
            filter,
            expected,
        }
    }
}

impl<C: ShardedRowCounter> ConvergenceSignal for ReconciledTotal<'_, C> {
    fn name(&self) -> String {
        format!(
            "rows for template {} reach {}",
            self.filter.template, self.expected
        )
    }

    fn observe(&self) -> impl Future<Output = core::result::Result<bool, CollaboratorError>> + Send {
        async move {
            let report = reconcile(self.counter, &self.filter).await;
            if report.counted() == 0 {
                return Err(CollaboratorError::Unavailable(
                    "no shard table was reachable".into(),
                ));
            }
            Ok(report.total >= self.expected)
        }
    }
}

/// Holds once `identifier` owns a row of `template` in the table its id
/// routes to.
pub struct RowPresent<'a, C, S> {
    counter: &'a C,
    strategy: &'a S,
    identifier: Identifier,
    template: TemplateHandle,
}

impl<'a, C: ShardedRowCounter, S: ShardStrategy> RowPresent<'a, C, S> {
    pub fn new(
        counter: &'a C,
        strategy: &'a S,
        identifier: Identifier,
        template: TemplateHandle,
    ) -> Self {
        Self {
            counter,
            strategy,
            identifier,
            template,
        }
    }
}

impl<C: ShardedRowCounter, S: ShardStrategy> ConvergenceSignal for RowPresent<'_, C, S> {
    fn name(&self) -> String {
        format!(
            "row for {} of template {} exists",
            self.identifier, self.template
        )
    }

    fn observe(&self) -> impl Future<Output = core::result::Result<bool, CollaboratorError>> + Send {
        async move {
            let rows = count_for(self.counter, self.strategy, &self.identifier, &self.template)
                .await?;
            Ok(rows > 0)
        }
    }
}
