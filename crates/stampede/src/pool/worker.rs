use super::UnitExecutor;
use crate::{CountdownLatch, Outcome, OutcomeSet, WorkUnit};
use core::{any::Any, panic::AssertUnwindSafe, time::Duration};
use futures::FutureExt;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

/// State shared between the pool and its workers for one run.
pub(crate) struct Gates {
    /// Counted down once per worker after it is scheduled.
    pub ready: CountdownLatch,
    /// Opened once by the pool after every unit is enqueued.
    pub start: CountdownLatch,
    /// Counted down once per unit.
    pub end: CountdownLatch,
    pub outcomes: OutcomeSet,
}

impl Gates {
    pub fn new(workers: usize, units: usize) -> Self {
        Self {
            ready: CountdownLatch::new(workers),
            start: CountdownLatch::new(1),
            end: CountdownLatch::new(units),
            outcomes: OutcomeSet::with_capacity(units),
        }
    }
}

/// Receiving half of a worker's queue.
///
/// Units still queued when it drops, because the worker task unwound or was
/// aborted, are recorded as panicked so the end gate always reaches zero.
struct Queue {
    rx: mpsc::Receiver<WorkUnit>,
    gates: Arc<Gates>,
}

impl Queue {
    async fn next(&mut self) -> Option<WorkUnit> {
        self.rx.recv().await
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(unit) = self.rx.try_recv() {
            let _done = self.gates.end.guard();
            self.gates.outcomes.record(Outcome::panicked(
                &unit,
                "worker exited before running the unit".to_string(),
                Duration::ZERO,
            ));
        }
    }
}

/// Worker task for a single burst.
///
/// Reports ready, parks on the start gate, then drains its queue. Every
/// received unit yields exactly one outcome, recorded before the end gate is
/// counted down. The loop ends when the pool drops the sending half.
pub(crate) async fn worker_loop<E>(
    worker_id: usize,
    rx: mpsc::Receiver<WorkUnit>,
    gates: Arc<Gates>,
    executor: Arc<E>,
    cancel: CancellationToken,
) where
    E: UnitExecutor,
{
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} parked at start gate");
    #[cfg(not(feature = "tracing"))]
    let _ = worker_id;

    let mut queue = Queue {
        rx,
        gates: Arc::clone(&gates),
    };

    gates.ready.count_down();
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = gates.start.wait() => {}
    }

    while let Some(unit) = queue.next().await {
        let _done = gates.end.guard();
        let started = Instant::now();

        let outcome = if cancel.is_cancelled() {
            Outcome::cancelled(&unit, started.elapsed())
        } else {
            // `execute` is called inside the guarded future so that panics
            // raised before the first await are caught as well.
            let call = AssertUnwindSafe(async { executor.execute(&unit).await }).catch_unwind();
            tokio::select! {
                biased;
                () = cancel.cancelled() => Outcome::cancelled(&unit, started.elapsed()),
                result = call => match result {
                    Ok(Ok(response)) => Outcome::from_response(&unit, response, started.elapsed()),
                    Ok(Err(e)) => Outcome::from_error(&unit, &e, started.elapsed()),
                    Err(panic) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("Worker {worker_id} caught panic executing unit {}", unit.id);
                        Outcome::panicked(&unit, panic_message(panic.as_ref()), started.elapsed())
                    }
                },
            }
        };

        gates.outcomes.record(outcome);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} drained");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "executor panicked".to_string()
    }
}
