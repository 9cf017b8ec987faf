use super::{
    worker::{worker_loop, Gates},
    Completion, PoolConfig, RunReport, UnitExecutor,
};
use crate::{Error, Result, WorkUnit};
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::{timeout, Instant},
};
use tokio_util::sync::CancellationToken;

/// Runs bursts of [`WorkUnit`]s through a barrier-gated set of workers.
///
/// The pool is cheap to construct and holds no workers between runs; each
/// [`run`](Self::run) spawns its own and joins them before returning.
pub struct BurstPool {
    config: PoolConfig,
    cancel: CancellationToken,
}

impl BurstPool {
    /// `cancel` is honoured at the start gate and during execution. Each run
    /// derives a child token, so a run timeout never cancels the caller.
    pub fn new(config: PoolConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Executes every unit exactly once as a synchronized burst.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `concurrency` is zero.
    /// - [`Error::AdmissionOverflow`] if more units were submitted than the
    ///   planned admission capacity.
    /// - [`Error::Cancelled`] if the caller's token fired before the burst
    ///   started.
    ///
    /// Per-unit failures are never errors; they are recorded in the report.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(units = units.len())))]
    pub async fn run<E>(&self, units: Vec<WorkUnit>, executor: Arc<E>) -> Result<RunReport>
    where
        E: UnitExecutor,
    {
        let total = units.len();
        if self.config.concurrency == 0 {
            return Err(Error::config("concurrency must be greater than 0"));
        }
        let capacity = self.config.admission_capacity.unwrap_or(total);
        if total > capacity {
            return Err(Error::AdmissionOverflow {
                submitted: total,
                capacity,
            });
        }
        if total == 0 {
            return Ok(RunReport::empty());
        }

        let workers = self.config.concurrency.min(total);
        let queue_depth = total.div_ceil(workers);
        let gates = Arc::new(Gates::new(workers, total));
        let token = self.cancel.child_token();

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(queue_depth);
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                rx,
                Arc::clone(&gates),
                Arc::clone(&executor),
                token.clone(),
            )));
        }

        for (seq, unit) in units.into_iter().enumerate() {
            match senders[seq % workers].try_send(unit) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    token.cancel();
                    return Err(Error::AdmissionOverflow {
                        submitted: total,
                        capacity: queue_depth * workers,
                    });
                }
                Err(TrySendError::Closed(_)) => {
                    token.cancel();
                    return Err(Error::Cancelled);
                }
            }
        }
        // Workers exit once their queue is empty.
        drop(senders);

        tokio::select! {
            biased;
            () = token.cancelled() => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Run cancelled before the start gate opened");
                token.cancel();
                futures::future::join_all(handles).await;
                return Err(Error::Cancelled);
            }
            () = gates.ready.wait() => {}
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("{workers} workers ready, releasing {total} units");
        let started = Instant::now();
        gates.start.open();

        let drained = match self.config.run_timeout {
            Some(limit) => timeout(limit, gates.end.wait()).await.is_ok(),
            None => {
                gates.end.wait().await;
                true
            }
        };
        let burst_duration = started.elapsed();

        let completion = if drained {
            Completion::Complete
        } else {
            let pending = gates.end.remaining();
            #[cfg(feature = "tracing")]
            tracing::warn!("Run deadline passed with {pending} of {total} units pending");
            token.cancel();
            if timeout(self.config.shutdown_grace, gates.end.wait())
                .await
                .is_err()
            {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "{} units did not drain within the shutdown grace",
                    gates.end.remaining()
                );
            }
            Completion::Incomplete { pending }
        };

        match timeout(self.config.shutdown_grace, futures::future::join_all(handles)).await {
            #[cfg(feature = "tracing")]
            Ok(joined) => {
                let dead = joined.iter().filter(|joined| joined.is_err()).count();
                if dead > 0 {
                    tracing::error!("{dead} workers exited abnormally");
                }
            }
            #[cfg(not(feature = "tracing"))]
            Ok(_) => {}
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker join timed out");
            }
        }

        Ok(RunReport {
            outcomes: gates.outcomes.snapshot(),
            completion,
            burst_duration,
            workers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        executor_fn, plan_units, ApiResponse, CollaboratorError, CountdownLatch, Identifier,
        OperationKind, TemplateHandle, UnitId, CODE_CANCELLED, CODE_PANICKED, CODE_TRANSPORT,
    };
    use core::time::Duration;
    use portable_atomic::{AtomicUsize, Ordering};

    fn units(count: u64) -> Vec<WorkUnit> {
        plan_units(
            (0..count).map(Identifier::from_u64),
            &TemplateHandle::new("t"),
            OperationKind::RedeemAsync,
        )
    }

    fn ok_executor() -> Arc<impl UnitExecutor> {
        Arc::new(executor_fn(|_unit: WorkUnit| async {
            Ok::<_, CollaboratorError>(ApiResponse::ok(None))
        }))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_unit_yields_exactly_one_outcome() {
        let pool = BurstPool::new(PoolConfig::new(16), CancellationToken::new());
        let report = pool.run(units(1_000), ok_executor()).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.workers, 16);
        assert_eq!(report.outcomes.len(), 1_000);
        assert_eq!(report.outcomes.success_count(), 1_000);
        assert_eq!(report.outcomes.rejected_writes(), 0);
        assert!(report.outcomes.iter().zip(0..).all(|(o, i)| o.unit == UnitId(i)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_unit_starts_before_every_unit_is_enqueued() {
        // Each unit waits until every other unit has started; this only
        // terminates if the burst is released as a whole.
        let count = 64;
        let started = Arc::new(CountdownLatch::new(count));
        let executor = {
            let started = Arc::clone(&started);
            executor_fn(move |_unit: WorkUnit| {
                let started = Arc::clone(&started);
                async move {
                    started.count_down();
                    started.wait().await;
                    Ok(ApiResponse::ok(None))
                }
            })
        };

        let pool = BurstPool::new(
            PoolConfig::new(count).with_run_timeout(Duration::from_secs(10)),
            CancellationToken::new(),
        );
        let report = pool.run(units(count as u64), Arc::new(executor)).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.outcomes.success_count(), count);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn errors_and_panics_stay_local_to_their_unit() {
        let executor = executor_fn(|unit: WorkUnit| async move {
            match unit.id.0 % 3 {
                0 => Ok(ApiResponse::ok(None)),
                1 => Err(CollaboratorError::Transport("reset".into())),
                _ => panic!("unit {} exploded", unit.id),
            }
        });

        let pool = BurstPool::new(PoolConfig::new(4), CancellationToken::new());
        let report = pool.run(units(30), Arc::new(executor)).await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 30);
        assert_eq!(report.outcomes.success_count(), 10);
        let by_code = report.outcomes.failures_by_code();
        assert_eq!(by_code.get(CODE_TRANSPORT), Some(&10));
        assert_eq!(by_code.get(CODE_PANICKED), Some(&10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn a_panic_before_the_first_await_fails_only_its_unit() {
        let executor = executor_fn(|unit: WorkUnit| {
            if unit.id.0 == 0 {
                panic!("executor rejected unit {}", unit.id);
            }
            async { Ok::<_, CollaboratorError>(ApiResponse::ok(None)) }
        });

        let pool = BurstPool::new(PoolConfig::new(2), CancellationToken::new());
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            pool.run(units(8), Arc::new(executor)),
        )
        .await
        .expect("burst hung after a synchronous panic")
        .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 8);
        assert_eq!(report.outcomes.success_count(), 7);
        assert_eq!(
            report.outcomes.failures_by_code().get(CODE_PANICKED),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn zero_concurrency_is_rejected() {
        let pool = BurstPool::new(PoolConfig::new(0), CancellationToken::new());
        let err = pool.run(units(3), ok_executor()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn submission_beyond_capacity_fails_before_any_work() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = {
            let calls = Arc::clone(&calls);
            executor_fn(move |_unit: WorkUnit| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Ok(ApiResponse::ok(None)) }
            })
        };
        let pool = BurstPool::new(
            PoolConfig::new(4).with_admission_capacity(10),
            CancellationToken::new(),
        );
        let err = pool.run(units(11), Arc::new(executor)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AdmissionOverflow {
                submitted: 11,
                capacity: 10
            }
        ));
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn empty_input_is_an_empty_complete_run() {
        let pool = BurstPool::new(PoolConfig::new(8), CancellationToken::new());
        let report = pool.run(Vec::new(), ok_executor()).await.unwrap();
        assert!(report.is_complete());
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_incomplete_and_cancels_stragglers() {
        let executor = executor_fn(|unit: WorkUnit| async move {
            // Units 6 and 7 are the last in their workers' queues.
            if unit.id.0 >= 6 {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            Ok(ApiResponse::ok(None))
        });
        let pool = BurstPool::new(
            PoolConfig::new(4).with_run_timeout(Duration::from_secs(1)),
            CancellationToken::new(),
        );
        let report = pool.run(units(8), Arc::new(executor)).await.unwrap();

        assert_eq!(report.completion, Completion::Incomplete { pending: 2 });
        assert_eq!(report.outcomes.len(), 8);
        assert_eq!(report.outcomes.success_count(), 6);
        assert_eq!(report.outcomes.count_matching(|o| o.is_cancelled()), 2);
        assert_eq!(report.outcomes.failures_by_code().get(CODE_CANCELLED), Some(&2));
    }

    #[tokio::test]
    async fn cancelled_caller_never_starts_the_burst() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = BurstPool::new(PoolConfig::new(2), cancel);
        let err = pool.run(units(4), ok_executor()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
