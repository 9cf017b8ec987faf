//! Queue-backed redemption burst.
//!
//! `users` unique identifiers contend for a template with `capacity` units.
//! The platform acknowledges each redemption before the row is written, so
//! the burst's outcomes are checked first and the persisted rows afterwards,
//! once they reconcile or the row poll gives up.

use super::{Platform, ScenarioPlan, converge, fixture_template, observed};
use crate::harness::telemetry;
use stampede::{
    ApiExecutor, CouponApi, Identifier, KeyValueObserver, OperationKind, ReconciledTotal,
    RowFilter, RunContext, ShardedRowCounter, VerdictSet, Violation, check_conservation,
    check_reconciliation, check_stock_exhausted, plan_units, reconcile,
};
use std::sync::Arc;

pub async fn run<A, K, C>(
    mut ctx: RunContext,
    platform: &Platform<A, K, C>,
    plan: &ScenarioPlan,
) -> anyhow::Result<VerdictSet>
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    let rows = platform.rows()?;
    let Some(template) =
        fixture_template(&mut ctx, platform.api.as_ref(), "mq-burst", plan.capacity).await
    else {
        return Ok(ctx.finish());
    };

    let units = plan_units(
        Identifier::random_unique(plan.users),
        &template,
        OperationKind::RedeemAsync,
    );
    let executor = Arc::new(ApiExecutor::new(
        Arc::clone(&platform.api),
        ctx.shop_number(),
    ));
    let report = ctx.pool().run(units, executor).await?;
    telemetry::record_burst(&report);

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Burst of {} redemptions finished in {:?} on {} workers: {} accepted, failures {:?}",
        report.outcomes.len(),
        report.burst_duration,
        report.workers,
        report.outcomes.success_count(),
        report.outcomes.failures_by_code()
    );

    if !report.is_complete() {
        ctx.record(
            "mq-burst/completion",
            Err(Violation::failed(format!(
                "burst did not drain before the run deadline: {:?}",
                report.completion
            ))),
        );
    }

    let capacity = u64::from(plan.capacity);
    ctx.record(
        "mq-burst/no-oversell",
        check_conservation(&report.outcomes, capacity, false),
    );

    let expected = capacity.min(plan.users as u64);
    let filter = RowFilter::template(&template);
    let persisted = converge(
        ctx.row_poller(),
        &ReconciledTotal::new(rows, filter.clone(), expected),
    )
    .await?;
    let converged = persisted.is_ok() && report.is_complete();
    ctx.record("mq-burst/persistence", persisted);

    ctx.record(
        "mq-burst/conservation",
        check_conservation(&report.outcomes, capacity, converged),
    );

    let totals = reconcile(rows, &filter).await;
    ctx.record(
        "mq-burst/reconciliation",
        check_reconciliation(&totals, expected),
    );
    if let Some(gaps) = totals.gaps() {
        ctx.note(format!("mq-burst/reconciliation: {gaps}"));
    }

    if plan.users as u64 >= capacity {
        let stock = observed(platform.kv.get(&ctx.keys().template_stock(&template)).await)
            .and_then(|stock| check_stock_exhausted(stock.as_deref()));
        ctx.record("mq-burst/stock-exhausted", stock);
    }

    Ok(ctx.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::scenario::fixtures;
    use core::time::Duration;
    use stampede::{PollPolicy, VerdictStatus, testing::PlatformConfig};
    use tokio_util::sync::CancellationToken;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contended_stock_is_sold_exactly_once_and_persisted() {
        let (fake, platform) = fixtures::platform(PlatformConfig::default());
        let ctx = RunContext::new(fixtures::settings(64), CancellationToken::new()).unwrap();

        let verdicts = run(ctx, &platform, &fixtures::plan()).await.unwrap();

        assert!(verdicts.all_passed(), "{verdicts}");
        let names: Vec<&str> = verdicts.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "mq-burst/no-oversell",
                "mq-burst/persistence",
                "mq-burst/conservation",
                "mq-burst/reconciliation",
                "mq-burst/stock-exhausted",
            ]
        );
        assert_eq!(fake.store_queries(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn full_scale_burst_sells_the_whole_stock_once() {
        let (fake, platform) = fixtures::platform(PlatformConfig::default());
        let mut settings = fixtures::settings(500);
        settings.row_poll = PollPolicy::new(Duration::from_millis(100), Duration::from_secs(30));
        let ctx = RunContext::new(settings, CancellationToken::new()).unwrap();
        let plan = ScenarioPlan {
            users: 50_000,
            capacity: 1_000,
            ..fixtures::plan()
        };

        let verdicts = run(ctx, &platform, &plan).await.unwrap();

        assert!(verdicts.all_passed(), "{verdicts}");
        let templates = fake.templates();
        assert_eq!(templates.len(), 1);
        assert_eq!(fake.persisted(&templates[0]), 1_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn rows_behind_missing_tables_never_converge() {
        let (_, platform) = fixtures::platform(PlatformConfig {
            unavailable_shards: (0..16).collect(),
            ..PlatformConfig::default()
        });
        let mut settings = fixtures::settings(32);
        settings.row_poll = PollPolicy::new(Duration::from_millis(20), Duration::from_millis(300));
        let ctx = RunContext::new(settings, CancellationToken::new()).unwrap();

        let verdicts = run(ctx, &platform, &fixtures::plan()).await.unwrap();

        let status = |name: &str| {
            verdicts
                .iter()
                .find(|v| v.name == name)
                .map(|v| v.status.clone())
                .unwrap()
        };
        assert!(matches!(
            status("mq-burst/persistence"),
            VerdictStatus::NotConverged { .. }
        ));
        assert_eq!(status("mq-burst/no-oversell"), VerdictStatus::Passed);
        match status("mq-burst/reconciliation") {
            VerdictStatus::Failed { reason } => assert!(reason.contains("unreachable shards")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!verdicts.all_passed());
        assert_eq!(verdicts.notes().len(), 1);
        assert!(verdicts.notes()[0].contains("16 of 32 shard tables not counted"));
    }
}
