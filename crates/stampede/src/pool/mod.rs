//! Barrier-gated worker pool.
//!
//! A run spawns a fixed set of workers, fills their bounded queues, waits for
//! every worker to park on the start gate and only then releases them
//! together. Each unit counts the end gate down exactly once, so the run
//! drains deterministically whether units succeed, fail, panic or get
//! cancelled.
//!
//! ```text
//!   plan ──► enqueue (round robin) ──► ready gate ──► start gate ──► end gate
//!                                       (workers)       (1)          (units)
//! ```

mod manager;
mod worker;

pub use manager::BurstPool;

use crate::{ApiResponse, CollaboratorError, CouponApi, OperationKind, OutcomeSnapshot, WorkUnit};
use core::{future::Future, time::Duration};
use std::sync::Arc;

/// How long cancelled workers get to record their remaining units before the
/// pool stops waiting for them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Sizing and timing for a single burst.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of workers. Capped at the number of units.
    pub concurrency: usize,
    /// Planned admission capacity. `None` sizes admission to the submitted
    /// units.
    pub admission_capacity: Option<usize>,
    /// Deadline on the end gate, measured from the start gate opening.
    pub run_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl PoolConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            admission_capacity: None,
            run_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    #[must_use]
    pub fn with_admission_capacity(mut self, capacity: usize) -> Self {
        self.admission_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Whether every unit finished before the run deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Completion {
    Complete,
    /// The deadline passed with `pending` units unfinished. Those units are
    /// recorded as cancelled if they drained within the shutdown grace.
    Incomplete { pending: usize },
}

/// Everything a run produced.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcomes: OutcomeSnapshot,
    pub completion: Completion,
    /// Time from the start gate opening to the end gate draining (or the
    /// deadline).
    pub burst_duration: Duration,
    pub workers: usize,
}

impl RunReport {
    pub(crate) fn empty() -> Self {
        Self {
            outcomes: OutcomeSnapshot::default(),
            completion: Completion::Complete,
            burst_duration: Duration::ZERO,
            workers: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completion == Completion::Complete
    }
}

/// Executes one unit against the system under test.
///
/// Errors are recorded as failed outcomes; they never abort the run.
pub trait UnitExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send;
}

/// Adapts an async closure into a [`UnitExecutor`].
#[derive(Clone, Debug)]
pub struct FnExecutor<F>(F);

/// Wraps `f` as an executor. The closure receives an owned copy of the unit.
pub fn executor_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(WorkUnit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse, CollaboratorError>> + Send,
{
    FnExecutor(f)
}

impl<F, Fut> UnitExecutor for FnExecutor<F>
where
    F: Fn(WorkUnit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ApiResponse, CollaboratorError>> + Send,
{
    fn execute(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        (self.0)(unit.clone())
    }
}

/// Dispatches each unit to the [`CouponApi`] call its kind names.
pub struct ApiExecutor<A: CouponApi> {
    api: Arc<A>,
    shop_number: String,
    template_spec: Option<Arc<A::TemplateSpec>>,
}

impl<A: CouponApi> ApiExecutor<A> {
    pub fn new(api: Arc<A>, shop_number: impl Into<String>) -> Self {
        Self {
            api,
            shop_number: shop_number.into(),
            template_spec: None,
        }
    }

    /// Payload sent by [`OperationKind::CreateTemplate`] units.
    #[must_use]
    pub fn with_template_spec(mut self, spec: A::TemplateSpec) -> Self {
        self.template_spec = Some(Arc::new(spec));
        self
    }
}

impl<A> UnitExecutor for ApiExecutor<A>
where
    A: CouponApi + 'static,
{
    fn execute(
        &self,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<ApiResponse, CollaboratorError>> + Send {
        async move {
            match unit.kind {
                OperationKind::RedeemAsync => {
                    self.api.redeem_async(&unit.template, &unit.identifier).await
                }
                OperationKind::RedeemSync => {
                    self.api.redeem_sync(&unit.template, &unit.identifier).await
                }
                OperationKind::QueryTemplate => {
                    self.api.find_template(&unit.template, &self.shop_number).await
                }
                OperationKind::CreateTemplate => match &self.template_spec {
                    Some(spec) => self.api.create_template(spec).await,
                    None => Err(CollaboratorError::Protocol(
                        "no template payload configured for create-template units".into(),
                    )),
                },
            }
        }
    }
}
