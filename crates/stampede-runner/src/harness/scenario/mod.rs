//! Verification scenarios.
//!
//! Each scenario builds its own [`RunContext`], drives the platform, and
//! hands back the verdicts it recorded. Collaborator failures while setting
//! up a fixture become failed verdicts; configuration errors and
//! cancellation abort the run.

pub mod cache_protection;
pub mod distribution;
pub mod idempotency;
pub mod mq_burst;
pub mod reconcile;
pub mod sync_consistency;

use crate::harness::telemetry;
use anyhow::Context;
use core::fmt;
use stampede::{
    Check, CollaboratorError, ConvergenceSignal, CouponApi, Error, Identifier, KeyValueObserver,
    Poller, RunContext, RunSettings, ShardedRowCounter, TemplateHandle, VerdictSet, Violation,
    create_template_handle,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// Queue-backed redemption burst: conservation and eventual persistence.
    MqBurst,
    /// Synchronous redemption: durable row first, user list later.
    SyncConsistency,
    /// Identical concurrent template submissions.
    Idempotency,
    /// Membership filter, negative cache and rebuild lock.
    CacheProtection,
    /// Bulk distribution task from a recipient file.
    Distribution,
    /// Cross-table row count of an existing template.
    Reconcile,
    /// mq-burst, sync-consistency, idempotency and cache-protection.
    All,
}

impl Scenario {
    /// The concrete scenarios this selection runs, in order.
    pub fn expand(self) -> Vec<Scenario> {
        match self {
            Self::All => vec![
                Self::MqBurst,
                Self::SyncConsistency,
                Self::Idempotency,
                Self::CacheProtection,
            ],
            other => vec![other],
        }
    }

    /// Whether the scenario reads persisted rows.
    pub fn needs_rows(self) -> bool {
        matches!(
            self,
            Self::MqBurst | Self::SyncConsistency | Self::Distribution | Self::Reconcile
        )
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MqBurst => "mq-burst",
            Self::SyncConsistency => "sync-consistency",
            Self::Idempotency => "idempotency",
            Self::CacheProtection => "cache-protection",
            Self::Distribution => "distribution",
            Self::Reconcile => "reconcile",
            Self::All => "all",
        };
        f.write_str(name)
    }
}

/// Sizes and fixtures of the scenarios.
#[derive(Clone, Debug)]
pub struct ScenarioPlan {
    /// Unique users in the queue-backed burst.
    pub users: usize,
    /// Stock of the burst template, and the expected total when reconciling.
    pub capacity: u32,
    pub duplicate_requests: usize,
    pub hot_key_clients: usize,
    /// Stock of templates created for single-user and lookup checks.
    pub fixture_stock: u32,
    /// Stock of the template a distribution task draws from.
    pub distribution_stock: u32,
    /// Recipient file and its first listed identifier.
    pub fixture: Option<(String, Identifier)>,
    /// Existing template for `reconcile`.
    pub template: Option<TemplateHandle>,
}

impl Default for ScenarioPlan {
    fn default() -> Self {
        Self {
            users: 50_000,
            capacity: 1_000,
            duplicate_requests: 20,
            hot_key_clients: 50,
            fixture_stock: 100,
            distribution_stock: 100_000,
            fixture: None,
            template: None,
        }
    }
}

/// The collaborators a scenario drives.
pub struct Platform<A, K, C> {
    pub api: Arc<A>,
    pub kv: K,
    rows: Option<C>,
}

impl<A, K, C> Platform<A, K, C>
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    pub fn new(api: Arc<A>, kv: K, rows: Option<C>) -> Self {
        Self { api, kv, rows }
    }

    /// # Errors
    ///
    /// When no row counter was configured.
    pub fn rows(&self) -> anyhow::Result<&C> {
        self.rows
            .as_ref()
            .context("this scenario needs a row counter (SHARD_COUNT_URL)")
    }
}

/// Runs `scenario` (every member of it, for `all`) and collects the verdicts.
///
/// # Errors
///
/// Configuration errors, routing exhaustion, admission overflow, cancellation.
pub async fn run_selected<A, K, C>(
    scenario: Scenario,
    platform: &Platform<A, K, C>,
    plan: &ScenarioPlan,
    settings: &RunSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<VerdictSet>
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    let mut verdicts = VerdictSet::new();
    for member in scenario.expand() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Running scenario `{member}`");

        let ctx = RunContext::new(settings.clone(), cancel.clone())?;
        let outcome = match member {
            Scenario::MqBurst => mq_burst::run(ctx, platform, plan).await,
            Scenario::SyncConsistency => sync_consistency::run(ctx, platform, plan).await,
            Scenario::Idempotency => idempotency::run(ctx, platform, plan).await,
            Scenario::CacheProtection => cache_protection::run(ctx, platform, plan).await,
            Scenario::Distribution => distribution::run(ctx, platform, plan).await,
            Scenario::Reconcile => reconcile::run(ctx, platform, plan).await,
            Scenario::All => Ok(VerdictSet::new()),
        };
        verdicts.extend(outcome.with_context(|| format!("scenario `{member}` aborted"))?);
    }
    Ok(verdicts)
}

/// Turns a collaborator failure into a failed check.
pub(crate) fn observed<T>(result: Result<T, CollaboratorError>) -> Result<T, Violation> {
    result.map_err(|e| Violation::failed(e.to_string()))
}

/// Polls `signal` and turns the outcome into a check. Only cancellation
/// escapes as an error.
pub(crate) async fn converge<S>(poller: &Poller, signal: &S) -> anyhow::Result<Check>
where
    S: ConvergenceSignal,
{
    let name = signal.name();
    match poller.await_signal(signal).await {
        Ok(convergence) => {
            telemetry::record_convergence(&name, &convergence);
            Ok(convergence
                .into_result(&name)
                .map(|_| ())
                .map_err(Violation::from))
        }
        Err(Error::Cancelled) => Err(Error::Cancelled.into()),
        Err(e) => Ok(Err(Violation::from(e))),
    }
}

/// Creates a template named after the run, recording a failed
/// `{label}/fixture` verdict if the platform does not hand back a handle.
pub(crate) async fn fixture_template<A: CouponApi>(
    ctx: &mut RunContext,
    api: &A,
    label: &str,
    stock: u32,
) -> Option<TemplateHandle> {
    let spec = api.template_fixture(&ctx.fixture_name(label), stock);
    match create_template_handle(api, &spec).await {
        Ok(template) => {
            #[cfg(feature = "tracing")]
            tracing::info!("Created template {template} with {stock} units for `{label}`");
            Some(template)
        }
        Err(e) => {
            ctx.record(format!("{label}/fixture"), Err(Violation::failed(e.to_string())));
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use stampede::testing::{FakePlatform, PlatformConfig};

    #[test]
    fn all_expands_to_the_four_core_scenarios() {
        assert_eq!(
            Scenario::All.expand(),
            vec![
                Scenario::MqBurst,
                Scenario::SyncConsistency,
                Scenario::Idempotency,
                Scenario::CacheProtection
            ]
        );
        assert_eq!(Scenario::Reconcile.expand(), vec![Scenario::Reconcile]);
        assert_eq!(Scenario::CacheProtection.to_string(), "cache-protection");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_passes_against_a_healthy_platform() {
        let (_, platform) = fixtures::platform(PlatformConfig::default());
        let verdicts = run_selected(
            Scenario::All,
            &platform,
            &fixtures::plan(),
            &fixtures::settings(64),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(verdicts.all_passed(), "{verdicts}");
        assert!(verdicts.len() >= 8);
    }

    #[tokio::test]
    async fn missing_row_counter_aborts_row_scenarios() {
        let fake = FakePlatform::new(PlatformConfig::default());
        let platform = Platform::new(Arc::new(fake.clone()), fake, None::<FakePlatform>);
        let err = run_selected(
            Scenario::MqBurst,
            &platform,
            &fixtures::plan(),
            &fixtures::settings(8),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("row counter"));
    }

    #[tokio::test]
    async fn cancelled_runs_stop_before_the_next_scenario() {
        let (_, platform) = fixtures::platform(PlatformConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run_selected(
            Scenario::All,
            &platform,
            &fixtures::plan(),
            &fixtures::settings(8),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Cancelled)));
    }
}
