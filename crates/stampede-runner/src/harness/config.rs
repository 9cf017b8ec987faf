use crate::harness::scenario::{Scenario, ScenarioPlan};
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use stampede::{
    DEFAULT_MAX_ROUTING_ATTEMPTS, DEFAULT_SHARD_COUNT, DEFAULT_SHOP_NUMBER, Identifier, KeyLayout,
    PollPolicy, PoolConfig, RunSettings, ShardScheme, TemplateHandle,
};
use stampede_client::HttpConfig;

/// Runtime configuration for the `stampede` binary.
///
/// Every knob can be given as a flag or an environment variable (a `.env`
/// file in the working directory is loaded first). Defaults describe the
/// reference deployment: 32 coupon tables, a 1000-unit template and 50000
/// contending users.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stampede",
    version,
    about = "Burst a coupon platform with concurrent requests and verify its invariants"
)]
pub struct CliArgs {
    /// Scenario to run.
    ///
    /// Environment variable: `SCENARIO`
    #[arg(long, env = "SCENARIO", value_enum, default_value_t = Scenario::All)]
    pub scenario: Scenario,

    /// Base URL of the merchant-admin service.
    ///
    /// Environment variable: `MERCHANT_URL`
    #[arg(long, env = "MERCHANT_URL", default_value_t = String::from("http://127.0.0.1:10020"))]
    pub merchant_url: String,

    /// Base URL of the engine service.
    ///
    /// Environment variable: `ENGINE_URL`
    #[arg(long, env = "ENGINE_URL", default_value_t = String::from("http://127.0.0.1:10010"))]
    pub engine_url: String,

    /// Per-request HTTP timeout in milliseconds.
    ///
    /// Environment variable: `HTTP_TIMEOUT_MS`
    #[arg(long, env = "HTTP_TIMEOUT_MS", default_value_t = 10_000)]
    pub http_timeout_ms: u64,

    /// Redis the engine caches into.
    ///
    /// Environment variable: `REDIS_URL`
    #[arg(long, env = "REDIS_URL", default_value_t = String::from("redis://127.0.0.1:6379"))]
    pub redis_url: String,

    /// Per-command Redis timeout in milliseconds.
    ///
    /// Environment variable: `REDIS_TIMEOUT_MS`
    #[arg(long, env = "REDIS_TIMEOUT_MS", default_value_t = 2_000)]
    pub redis_timeout_ms: u64,

    /// Global prefix the engine applies to its Redis keys (e.g. `jianbing:`).
    ///
    /// Environment variable: `KEY_PREFIX`
    #[arg(long, env = "KEY_PREFIX", default_value_t = String::new())]
    pub key_prefix: String,

    /// Endpoint answering per-table row counts. Required by scenarios that
    /// inspect persisted rows.
    ///
    /// Environment variable: `SHARD_COUNT_URL`
    #[arg(long, env = "SHARD_COUNT_URL")]
    pub shard_count_url: Option<String>,

    /// Number of horizontally sharded coupon tables.
    ///
    /// Environment variable: `SHARD_COUNT`
    #[arg(long, env = "SHARD_COUNT", default_value_t = DEFAULT_SHARD_COUNT)]
    pub shard_count: u32,

    /// Table the synchronous-consistency scenario routes its user to.
    ///
    /// Environment variable: `TARGET_SHARD`
    #[arg(long, env = "TARGET_SHARD", default_value_t = 0)]
    pub target_shard: u32,

    /// How user ids map to tables.
    ///
    /// Environment variable: `SHARD_SCHEME`
    #[arg(long, env = "SHARD_SCHEME", value_enum, default_value_t = SchemeArg::JavaLongHash)]
    pub shard_scheme: SchemeArg,

    /// Candidate ids probed before routing gives up.
    ///
    /// Environment variable: `ROUTING_MAX_ATTEMPTS`
    #[arg(long, env = "ROUTING_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ROUTING_ATTEMPTS)]
    pub routing_max_attempts: u64,

    /// Concurrent workers in a burst.
    ///
    /// Environment variable: `CONCURRENCY`
    #[arg(long, env = "CONCURRENCY", default_value_t = 500)]
    pub concurrency: usize,

    /// Unique users contending in the queue-backed burst.
    ///
    /// Environment variable: `USERS`
    #[arg(long, env = "USERS", default_value_t = 50_000)]
    pub users: usize,

    /// Stock of the template the burst contends for.
    ///
    /// Environment variable: `CAPACITY`
    #[arg(long, env = "CAPACITY", default_value_t = 1_000)]
    pub capacity: u32,

    /// Identical template submissions in the idempotency scenario.
    ///
    /// Environment variable: `DUPLICATE_REQUESTS`
    #[arg(long, env = "DUPLICATE_REQUESTS", default_value_t = 20)]
    pub duplicate_requests: usize,

    /// Concurrent lookups of the evicted hot key.
    ///
    /// Environment variable: `HOT_KEY_CLIENTS`
    #[arg(long, env = "HOT_KEY_CLIENTS", default_value_t = 50)]
    pub hot_key_clients: usize,

    /// Upper bound on queued work units; defaults to `USERS`.
    ///
    /// Environment variable: `ADMISSION_CAPACITY`
    #[arg(long, env = "ADMISSION_CAPACITY")]
    pub admission_capacity: Option<usize>,

    /// Deadline for a whole burst, in milliseconds. Unset waits for every
    /// unit.
    ///
    /// Environment variable: `RUN_TIMEOUT_MS`
    #[arg(long, env = "RUN_TIMEOUT_MS")]
    pub run_timeout_ms: Option<u64>,

    /// Poll interval for key-value observations, in milliseconds.
    ///
    /// Environment variable: `KV_POLL_INTERVAL_MS`
    #[arg(long, env = "KV_POLL_INTERVAL_MS", default_value_t = 500)]
    pub kv_poll_interval_ms: u64,

    /// Poll deadline for key-value observations, in milliseconds.
    ///
    /// Environment variable: `KV_POLL_TIMEOUT_MS`
    #[arg(long, env = "KV_POLL_TIMEOUT_MS", default_value_t = 10_000)]
    pub kv_poll_timeout_ms: u64,

    /// Poll interval for persisted rows, in milliseconds.
    ///
    /// Environment variable: `ROW_POLL_INTERVAL_MS`
    #[arg(long, env = "ROW_POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub row_poll_interval_ms: u64,

    /// Poll deadline for persisted rows, in milliseconds.
    ///
    /// Environment variable: `ROW_POLL_TIMEOUT_MS`
    #[arg(long, env = "ROW_POLL_TIMEOUT_MS", default_value_t = 30_000)]
    pub row_poll_timeout_ms: u64,

    /// Cap on evaluations per poll, on top of the deadline.
    ///
    /// Environment variable: `POLL_MAX_ATTEMPTS`
    #[arg(long, env = "POLL_MAX_ATTEMPTS")]
    pub poll_max_attempts: Option<u32>,

    /// Consecutive observation errors tolerated before a poll fails.
    ///
    /// Environment variable: `POLL_ERROR_BUDGET`
    #[arg(long, env = "POLL_ERROR_BUDGET", default_value_t = stampede::DEFAULT_ERROR_BUDGET)]
    pub poll_error_budget: u32,

    /// Shop the templates belong to.
    ///
    /// Environment variable: `SHOP_NUMBER`
    #[arg(long, env = "SHOP_NUMBER", default_value_t = String::from(DEFAULT_SHOP_NUMBER))]
    pub shop_number: String,

    /// Recipient spreadsheet the distribution task reads, as seen by the
    /// platform.
    ///
    /// Environment variable: `FIXTURE_PATH`
    #[arg(long, env = "FIXTURE_PATH")]
    pub fixture_path: Option<String>,

    /// First recipient listed in `FIXTURE_PATH`.
    ///
    /// Environment variable: `FIXTURE_IDENTIFIER`
    #[arg(long, env = "FIXTURE_IDENTIFIER")]
    pub fixture_identifier: Option<String>,

    /// Existing template to reconcile instead of creating one.
    ///
    /// Environment variable: `TEMPLATE_ID`
    #[arg(long, env = "TEMPLATE_ID")]
    pub template_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum SchemeArg {
    /// `abs(java_long_hash(id)) % tables`
    JavaLongHash,
    /// `id % tables`
    PlainModulo,
}

impl From<SchemeArg> for ShardScheme {
    fn from(arg: SchemeArg) -> Self {
        match arg {
            SchemeArg::JavaLongHash => Self::JavaLongHash,
            SchemeArg::PlainModulo => Self::PlainModulo,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub scenario: Scenario,
    pub http: HttpConfig,
    pub redis_url: String,
    pub redis_timeout: Duration,
    pub shard_count_url: Option<String>,
    pub settings: RunSettings,
    pub plan: ScenarioPlan,
}

impl TryFrom<CliArgs> for RunnerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.concurrency == 0 {
            bail!("CONCURRENCY must be greater than 0");
        }
        if args.shard_count == 0 {
            bail!("SHARD_COUNT must be greater than 0");
        }
        if args.target_shard >= args.shard_count {
            bail!(
                "TARGET_SHARD ({}) must be below SHARD_COUNT ({})",
                args.target_shard,
                args.shard_count
            );
        }
        if args.routing_max_attempts == 0 {
            bail!("ROUTING_MAX_ATTEMPTS must be greater than 0");
        }
        if args.users == 0 || args.capacity == 0 {
            bail!("USERS and CAPACITY must be greater than 0");
        }
        if args.duplicate_requests < 2 {
            bail!(
                "DUPLICATE_REQUESTS ({}) must be at least 2",
                args.duplicate_requests
            );
        }
        if args.hot_key_clients == 0 {
            bail!("HOT_KEY_CLIENTS must be greater than 0");
        }
        if args.http_timeout_ms == 0 || args.redis_timeout_ms == 0 {
            bail!("HTTP_TIMEOUT_MS and REDIS_TIMEOUT_MS must be greater than 0");
        }

        let largest_burst = args
            .users
            .max(args.duplicate_requests)
            .max(args.hot_key_clients);
        let admission = args.admission_capacity.unwrap_or(largest_burst);
        if admission < largest_burst {
            bail!("ADMISSION_CAPACITY ({admission}) cannot hold a burst of {largest_burst} units");
        }

        let kv_poll = poll_policy(
            args.kv_poll_interval_ms,
            args.kv_poll_timeout_ms,
            &args,
        )?;
        let row_poll = poll_policy(
            args.row_poll_interval_ms,
            args.row_poll_timeout_ms,
            &args,
        )?;

        let scenarios = args.scenario.expand();
        if scenarios.iter().any(|s| s.needs_rows()) && args.shard_count_url.is_none() {
            bail!("SHARD_COUNT_URL is required by the `{}` scenario", args.scenario);
        }
        let fixture = match (&args.fixture_path, &args.fixture_identifier) {
            (Some(path), Some(identifier)) => Some((path.clone(), Identifier::new(identifier))),
            (None, None) => None,
            _ => bail!("FIXTURE_PATH and FIXTURE_IDENTIFIER must be given together"),
        };
        if scenarios.contains(&Scenario::Distribution) && fixture.is_none() {
            bail!("the `distribution` scenario needs FIXTURE_PATH and FIXTURE_IDENTIFIER");
        }
        if scenarios.contains(&Scenario::Reconcile) && args.template_id.is_none() {
            bail!("the `reconcile` scenario needs TEMPLATE_ID");
        }

        let mut pool = PoolConfig::new(args.concurrency).with_admission_capacity(admission);
        if let Some(ms) = args.run_timeout_ms {
            pool = pool.with_run_timeout(Duration::from_millis(ms));
        }

        let settings = RunSettings {
            pool,
            kv_poll,
            row_poll,
            keys: KeyLayout::new(args.key_prefix.clone()),
            shop_number: args.shop_number.clone(),
            shard_count: args.shard_count,
            target_shard: args.target_shard,
            scheme: args.shard_scheme.into(),
            max_routing_attempts: args.routing_max_attempts,
        };

        let plan = ScenarioPlan {
            users: args.users,
            capacity: args.capacity,
            duplicate_requests: args.duplicate_requests,
            hot_key_clients: args.hot_key_clients,
            fixture,
            template: args.template_id.map(TemplateHandle::new),
            ..ScenarioPlan::default()
        };

        let http = HttpConfig::new(args.merchant_url, args.engine_url, args.shop_number)
            .with_timeout(Duration::from_millis(args.http_timeout_ms));

        Ok(Self {
            scenario: args.scenario,
            http,
            redis_url: args.redis_url,
            redis_timeout: Duration::from_millis(args.redis_timeout_ms),
            shard_count_url: args.shard_count_url,
            settings,
            plan,
        })
    }
}

fn poll_policy(interval_ms: u64, timeout_ms: u64, args: &CliArgs) -> anyhow::Result<PollPolicy> {
    let mut policy = PollPolicy::new(
        Duration::from_millis(interval_ms),
        Duration::from_millis(timeout_ms),
    )
    .with_error_budget(args.poll_error_budget);
    if let Some(max) = args.poll_max_attempts {
        policy = policy.with_max_attempts(max);
    }
    policy.validate()?;
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<RunnerConfig> {
        let mut argv = vec!["stampede", "--shard-count-url", "http://127.0.0.1:1/count"];
        argv.extend_from_slice(extra);
        RunnerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_describe_the_reference_deployment() {
        let config = parse(&["--scenario", "mq-burst"]).unwrap();
        assert_eq!(config.scenario, Scenario::MqBurst);
        assert_eq!(config.settings.shard_count, 32);
        assert_eq!(config.settings.pool.concurrency, 500);
        assert_eq!(config.settings.pool.admission_capacity, Some(50_000));
        assert_eq!(config.plan.users, 50_000);
        assert_eq!(config.plan.capacity, 1_000);
        assert_eq!(config.settings.kv_poll, PollPolicy::key_value());
        assert_eq!(config.settings.row_poll, PollPolicy::persistence());
    }

    #[test]
    fn invalid_knobs_fail_fast() {
        for bad in [
            &["--concurrency", "0"][..],
            &["--target-shard", "32"],
            &["--routing-max-attempts", "0"],
            &["--duplicate-requests", "1"],
            &["--kv-poll-interval-ms", "20000"],
            &["--admission-capacity", "10"],
        ] {
            assert!(parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn scenario_prerequisites_are_checked() {
        assert!(parse(&["--scenario", "reconcile"]).is_err());
        assert!(parse(&["--scenario", "reconcile", "--template-id", "42"]).is_ok());
        assert!(parse(&["--scenario", "distribution", "--fixture-path", "/tmp/u.xlsx"]).is_err());
        assert!(
            parse(&[
                "--scenario",
                "distribution",
                "--fixture-path",
                "/tmp/u.xlsx",
                "--fixture-identifier",
                "1810000000000000001",
            ])
            .is_ok()
        );

        let no_rows = RunnerConfig::try_from(
            CliArgs::try_parse_from(["stampede", "--scenario", "sync-consistency"]).unwrap(),
        );
        assert!(no_rows.is_err());
        let lookups_only = RunnerConfig::try_from(
            CliArgs::try_parse_from(["stampede", "--scenario", "cache-protection"]).unwrap(),
        );
        assert!(lookups_only.is_ok());
    }
}
