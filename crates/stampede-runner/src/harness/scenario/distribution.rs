//! Bulk distribution from a recipient file.
//!
//! The merchant service reads the file asynchronously and issues one coupon
//! per listed user, so the scenario only watches the first recipient's row.

use super::{Platform, ScenarioPlan, converge, fixture_template};
use anyhow::Context;
use stampede::{
    CouponApi, KeyValueObserver, RowPresent, RunContext, ShardedRowCounter, VerdictSet, Violation,
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
    let (fixture_path, first_recipient) = plan
        .fixture
        .clone()
        .context("distribution needs a recipient file and its first identifier")?;
    let Some(template) = fixture_template(
        &mut ctx,
        platform.api.as_ref(),
        "distribution",
        plan.distribution_stock,
    )
    .await
    else {
        return Ok(ctx.finish());
    };

    let spec = platform.api.task_fixture(
        &ctx.fixture_name("distribution-task"),
        &template,
        &fixture_path,
    );
    let accepted = match platform.api.create_distribution_task(&spec).await {
        Ok(response) if response.is_accepted() => Ok(()),
        Ok(response) => Err(Violation::failed(format!(
            "task for {fixture_path} rejected: code {:?}, message {:?}",
            response.code, response.message
        ))),
        Err(e) => Err(Violation::failed(format!("task submission failed: {e}"))),
    };
    if !ctx.record("distribution/task-accepted", accepted) {
        return Ok(ctx.finish());
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Waiting for {first_recipient} to receive template {template}");

    let delivered = converge(
        ctx.row_poller(),
        &RowPresent::new(rows, ctx.router().strategy(), first_recipient, template),
    )
    .await?;
    ctx.record("distribution/first-recipient-issued", delivered);

    Ok(ctx.finish())
}
