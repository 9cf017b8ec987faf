//! The engine's three lines of defence in front of the template store.
//!
//! - penetration: an id the membership filter never saw is turned away
//!   before a negative cache entry is written;
//! - negative cache: an id forged into the filter misses once, leaves a null
//!   entry, and the repeat lookup is answered from it;
//! - breakdown: a hot template whose cache entry expired is rebuilt under a
//!   storm of concurrent lookups without failing any of them.

use super::{Platform, ScenarioPlan, fixture_template, observed};
use crate::harness::telemetry;
use stampede::{
    ApiExecutor, Check, CouponApi, Identifier, KeyValueObserver, OperationKind, RunContext,
    ShardedRowCounter, StoreCounters, TemplateHandle, TimedLookup, VerdictSet, Violation,
    check_breakdown_rebuild, check_negative_cache, check_penetration_blocked, plan_identical,
};
use std::sync::Arc;
use tokio::time::Instant;

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
    let penetration = penetration(&ctx, platform).await;
    ctx.record("cache-protection/penetration", penetration);

    let negative = negative_cache(&ctx, platform).await;
    ctx.record("cache-protection/negative-cache", negative);

    let Some(template) = fixture_template(
        &mut ctx,
        platform.api.as_ref(),
        "cache-protection",
        plan.fixture_stock,
    )
    .await
    else {
        return Ok(ctx.finish());
    };
    let breakdown = breakdown(&ctx, platform, &template, plan.hot_key_clients).await?;
    ctx.record("cache-protection/breakdown", breakdown);

    Ok(ctx.finish())
}

async fn timed_lookup<A: CouponApi>(
    api: &A,
    template: &TemplateHandle,
    shop_number: &str,
) -> Result<TimedLookup, Violation> {
    let started = Instant::now();
    let response = observed(api.find_template(template, shop_number).await)?;
    Ok(TimedLookup {
        response,
        elapsed: started.elapsed(),
    })
}

/// Store activity since `before`, when the deployment exposes its counters.
fn counted_since<K>(kv: &K, before: Option<StoreCounters>) -> Option<StoreCounters>
where
    K: KeyValueObserver,
{
    Some(kv.store_counters()?.since(before?))
}

async fn penetration<A, K, C>(ctx: &RunContext, platform: &Platform<A, K, C>) -> Check
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    let unknown = TemplateHandle::new(format!("999{}", ctx.run_id()));
    let response = observed(platform.api.find_template(&unknown, ctx.shop_number()).await)?;
    let null_entry = observed(
        platform
            .kv
            .exists(&ctx.keys().template_is_null(&unknown))
            .await,
    )?;
    check_penetration_blocked(&response, null_entry)
}

async fn negative_cache<A, K, C>(ctx: &RunContext, platform: &Platform<A, K, C>) -> Check
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    let forged = TemplateHandle::new(format!("888{}", ctx.run_id()));
    observed(
        platform
            .kv
            .forge_filter_entry(&ctx.keys().bloom_filter(), forged.as_str())
            .await,
    )?;

    #[cfg(feature = "tracing")]
    tracing::debug!("Forged {forged} into the membership filter");

    let before = platform.kv.store_counters();
    let first = timed_lookup(platform.api.as_ref(), &forged, ctx.shop_number()).await?;
    let null_entry = observed(
        platform
            .kv
            .exists(&ctx.keys().template_is_null(&forged))
            .await,
    )?;
    let second = timed_lookup(platform.api.as_ref(), &forged, ctx.shop_number()).await?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Negative lookups took {:?} then {:?}",
        first.elapsed,
        second.elapsed
    );

    let queries = counted_since(&platform.kv, before).map(|counted| counted.queries);
    check_negative_cache(&first, &second, null_entry, queries)
}

/// Returns an error only if the burst itself could not run.
async fn breakdown<A, K, C>(
    ctx: &RunContext,
    platform: &Platform<A, K, C>,
    template: &TemplateHandle,
    clients: usize,
) -> anyhow::Result<Check>
where
    A: CouponApi + 'static,
    K: KeyValueObserver,
    C: ShardedRowCounter,
{
    let cache_key = ctx.keys().template(template);
    if let Err(violation) = observed(platform.kv.evict(&cache_key).await) {
        return Ok(Err(violation));
    }

    let units = plan_identical(
        clients,
        &Identifier::new(ctx.run_id()),
        template,
        OperationKind::QueryTemplate,
    );
    let executor = Arc::new(ApiExecutor::new(
        Arc::clone(&platform.api),
        ctx.shop_number(),
    ));
    let before = platform.kv.store_counters();
    let report = ctx.pool_with_concurrency(clients).run(units, executor).await?;
    telemetry::record_burst(&report);
    let rebuilds = counted_since(&platform.kv, before).map(|counted| counted.rebuilds);

    Ok(observed(platform.kv.exists(&cache_key).await)
        .and_then(|rebuilt| check_breakdown_rebuild(&report.outcomes, rebuilt, rebuilds)))
}
