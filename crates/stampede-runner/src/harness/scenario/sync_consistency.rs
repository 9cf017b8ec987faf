//! Synchronous redemption: the row is durable when the call returns, the
//! user's coupon list follows through change data capture.

use super::{Platform, ScenarioPlan, converge, fixture_template, observed};
use stampede::{
    CouponApi, KeyExists, KeyValueObserver, RunContext, ShardedRowCounter, VerdictSet, Violation,
    check_strong_consistency, count_for,
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
    let Some(template) = fixture_template(
        &mut ctx,
        platform.api.as_ref(),
        "sync-consistency",
        plan.fixture_stock,
    )
    .await
    else {
        return Ok(ctx.finish());
    };

    let settings = ctx.settings();
    let identifier = ctx
        .router()
        .route_to_shard(settings.shard_count, settings.target_shard)?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Redeeming template {template} for {identifier} on shard {}",
        settings.target_shard
    );

    let response = match platform.api.redeem_sync(&template, &identifier).await {
        Ok(response) => response,
        Err(e) => {
            ctx.record(
                "sync-consistency/strong-consistency",
                Err(Violation::failed(format!("redemption failed: {e}"))),
            );
            return Ok(ctx.finish());
        }
    };
    let committed = response.is_success();

    let visible = observed(count_for(rows, ctx.router().strategy(), &identifier, &template).await)
        .and_then(|rows| check_strong_consistency(&response, rows));
    ctx.record("sync-consistency/strong-consistency", visible);

    if committed {
        let list_key = ctx.keys().user_template_list(&identifier);
        let propagated = converge(ctx.kv_poller(), &KeyExists::new(&platform.kv, list_key)).await?;
        ctx.record("sync-consistency/user-list-propagation", propagated);
    }

    Ok(ctx.finish())
}
