//! Identical concurrent template submissions.

use super::{Platform, ScenarioPlan};
use crate::harness::telemetry;
use stampede::{
    ApiExecutor, CouponApi, DUPLICATE_MARKERS, Identifier, KeyValueObserver, OperationKind,
    RunContext, ShardedRowCounter, TemplateHandle, VerdictSet, check_idempotency, plan_identical,
};
use std::sync::Arc;

/// Fires `duplicate_requests` copies of one template payload at once, one per
/// worker, and expects exactly one to be accepted.
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
    let name = ctx.fixture_name("idempotency");
    let spec = platform.api.template_fixture(&name, plan.fixture_stock);
    // Every unit sends the same payload; the name doubles as the dedup key.
    let units = plan_identical(
        plan.duplicate_requests,
        &Identifier::new(name.clone()),
        &TemplateHandle::new(name),
        OperationKind::CreateTemplate,
    );
    let executor = Arc::new(
        ApiExecutor::new(Arc::clone(&platform.api), ctx.shop_number()).with_template_spec(spec),
    );

    let report = ctx
        .pool_with_concurrency(plan.duplicate_requests)
        .run(units, executor)
        .await?;
    telemetry::record_burst(&report);

    ctx.record(
        "idempotency/single-acceptance",
        check_idempotency(&report.outcomes, DUPLICATE_MARKERS),
    );
    Ok(ctx.finish())
}
