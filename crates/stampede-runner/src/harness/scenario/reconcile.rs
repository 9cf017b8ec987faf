//! Cross-table row count of a template that was already exercised.

use super::{Platform, ScenarioPlan, observed};
use anyhow::Context;
use stampede::{
    CouponApi, KeyValueObserver, RowFilter, RunContext, ShardedRowCounter, VerdictSet,
    check_reconciliation, check_stock_exhausted, reconcile,
};

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
    let template = plan
        .template
        .clone()
        .context("reconcile needs the id of an existing template")?;

    let report = reconcile(rows, &RowFilter::template(&template)).await;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Template {template}: {} rows over {} of {} tables",
        report.total,
        report.counted(),
        report.table_count
    );

    ctx.record(
        "reconcile/rows",
        check_reconciliation(&report, u64::from(plan.capacity)),
    );
    if let Some(gaps) = report.gaps() {
        ctx.note(format!("reconcile/rows: {gaps}"));
    }

    let stock = observed(platform.kv.get(&ctx.keys().template_stock(&template)).await)
        .and_then(|stock| check_stock_exhausted(stock.as_deref()));
    ctx.record("reconcile/stock-exhausted", stock);

    Ok(ctx.finish())
}
