//! Per-run state threaded through the pool, poller and verifier.

use crate::{
    BurstPool, Check, Error, KeyLayout, PollPolicy, PoolConfig, Poller, Result, ShardRouter,
    ShardScheme, ShardStrategy, VerdictSet, DEFAULT_MAX_ROUTING_ATTEMPTS,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Shop the fixture templates belong to.
pub const DEFAULT_SHOP_NUMBER: &str = "1810714735922956666";
/// Number of horizontally sharded coupon tables.
pub const DEFAULT_SHARD_COUNT: u32 = 32;

/// Everything a run needs to know up front.
#[derive(Clone, Debug)]
pub struct RunSettings {
    pub pool: PoolConfig,
    pub kv_poll: PollPolicy,
    pub row_poll: PollPolicy,
    pub keys: KeyLayout,
    pub shop_number: String,
    pub shard_count: u32,
    /// Shard whose table the run observes.
    pub target_shard: u32,
    pub scheme: ShardScheme,
    pub max_routing_attempts: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            pool: PoolConfig::new(500),
            kv_poll: PollPolicy::key_value(),
            row_poll: PollPolicy::persistence(),
            keys: KeyLayout::default(),
            shop_number: DEFAULT_SHOP_NUMBER.to_string(),
            shard_count: DEFAULT_SHARD_COUNT,
            target_shard: 0,
            scheme: ShardScheme::default(),
            max_routing_attempts: DEFAULT_MAX_ROUTING_ATTEMPTS,
        }
    }
}

/// Scoped state of one scenario run.
///
/// Owns the run's identifier router (so routed identifiers are never shared
/// across runs), its cancellation token and the verdicts collected so far.
pub struct RunContext {
    run_id: String,
    settings: RunSettings,
    router: ShardRouter<Box<dyn ShardStrategy>>,
    kv_poller: Poller,
    row_poller: Poller,
    cancel: CancellationToken,
    verdicts: VerdictSet,
}

impl RunContext {
    /// Validates `settings` and builds the context.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfig`] for zero concurrency, an out-of-range target
    /// shard, a zero routing ceiling, or an invalid poll policy. Nothing has
    /// touched the system under test at this point.
    pub fn new(settings: RunSettings, cancel: CancellationToken) -> Result<Self> {
        if settings.pool.concurrency == 0 {
            return Err(Error::config("concurrency must be greater than 0"));
        }
        if settings.shard_count == 0 {
            return Err(Error::config("shard count must be greater than 0"));
        }
        if settings.target_shard >= settings.shard_count {
            return Err(Error::config(format!(
                "target shard {} is out of range for {} shards",
                settings.target_shard, settings.shard_count
            )));
        }
        if settings.max_routing_attempts == 0 {
            return Err(Error::config("routing max attempts must be greater than 0"));
        }
        let kv_poller = Poller::new(settings.kv_poll, cancel.clone())?;
        let row_poller = Poller::new(settings.row_poll, cancel.clone())?;

        let router = ShardRouter::with_strategy(settings.scheme.strategy())
            .with_max_attempts(settings.max_routing_attempts);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Ok(Self {
            run_id: millis.to_string(),
            settings,
            router,
            kv_poller,
            row_poller,
            cancel,
            verdicts: VerdictSet::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.settings.keys
    }

    pub fn shop_number(&self) -> &str {
        &self.settings.shop_number
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn router(&self) -> &ShardRouter<Box<dyn ShardStrategy>> {
        &self.router
    }

    /// Fixture name unique to this run, e.g. `mq-burst_1733400000000`.
    pub fn fixture_name(&self, label: &str) -> String {
        format!("{label}_{}", self.run_id)
    }

    /// Pool sized from the run settings.
    pub fn pool(&self) -> BurstPool {
        BurstPool::new(self.settings.pool.clone(), self.cancel.clone())
    }

    /// Pool with the run's timing but a different worker count.
    pub fn pool_with_concurrency(&self, concurrency: usize) -> BurstPool {
        let config = PoolConfig {
            concurrency,
            ..self.settings.pool.clone()
        };
        BurstPool::new(config, self.cancel.clone())
    }

    /// Poller for key-value observations.
    pub fn kv_poller(&self) -> &Poller {
        &self.kv_poller
    }

    /// Poller for persisted rows.
    pub fn row_poller(&self) -> &Poller {
        &self.row_poller
    }

    /// Records a verdict; returns whether it passed.
    pub fn record(&mut self, name: impl Into<String>, check: Check) -> bool {
        self.verdicts.record(name, check)
    }

    /// Adds a note to the run's report.
    pub fn note(&mut self, note: impl Into<String>) {
        self.verdicts.note(note);
    }

    pub fn verdicts(&self) -> &VerdictSet {
        &self.verdicts
    }

    /// Ends the run and hands back its verdicts.
    pub fn finish(self) -> VerdictSet {
        self.verdicts
    }
}
