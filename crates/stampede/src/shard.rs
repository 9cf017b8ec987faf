//! Deterministic routing of generated identifiers onto a target shard.
//!
//! The external system spreads rows across `N` tables using a hash/modulo
//! function of the user identifier. To verify persistence from a single
//! observation point, the harness brute-forces identifiers that the same
//! function sends to a chosen shard.
//!
//! The hash scheme is an assumption about the external sharding layer, so it is
//! injected through [`ShardStrategy`] rather than baked in. If the real scheme
//! differs, routed identifiers land elsewhere and the observation becomes a
//! false negative; swapping the strategy is the fix.

use crate::{Error, Identifier, Result};
use portable_atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Default probe ceiling for a single routing call.
///
/// With a well-distributed hash the expected probe count is `N`; this leaves
/// several orders of magnitude of headroom for the shard counts seen in
/// practice while still bounding a pathological strategy.
pub const DEFAULT_MAX_ROUTING_ATTEMPTS: u64 = 1_000_000;

/// A hash/modulo scheme mapping a numeric key to a shard index.
pub trait ShardStrategy: Send + Sync {
    /// Returns the shard `value` lands on, or `None` if the scheme maps it
    /// outside `[0, shard_count)`.
    fn shard_of(&self, value: u64, shard_count: u32) -> Option<u32>;
}

/// `Math.abs(Long.hashCode(value)) % N`, with JVM integer semantics.
///
/// `Long.hashCode` folds the high word into the low word and truncates to a
/// signed 32-bit integer. `Math.abs(i32::MIN)` stays negative on the JVM, so
/// that single hash value maps to `i32::MIN % N`, which is only a valid shard
/// when `N` divides `2^31`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JavaLongHashMod;

impl ShardStrategy for JavaLongHashMod {
    fn shard_of(&self, value: u64, shard_count: u32) -> Option<u32> {
        if shard_count == 0 {
            return None;
        }
        let hash = (value ^ (value >> 32)) as u32 as i32;
        let modulus = i64::from(shard_count);
        let rem = i64::from(hash.wrapping_abs()) % modulus;
        u32::try_from(rem).ok()
    }
}

impl<S> ShardStrategy for Box<S>
where
    S: ShardStrategy + ?Sized,
{
    fn shard_of(&self, value: u64, shard_count: u32) -> Option<u32> {
        (**self).shard_of(value, shard_count)
    }
}

/// Plain `value % N`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainModulo;

impl ShardStrategy for PlainModulo {
    fn shard_of(&self, value: u64, shard_count: u32) -> Option<u32> {
        if shard_count == 0 {
            return None;
        }
        Some((value % u64::from(shard_count)) as u32)
    }
}

/// Selects one of the shipped strategies at runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ShardScheme {
    #[default]
    JavaLongHash,
    PlainModulo,
}

impl ShardScheme {
    pub fn strategy(self) -> Box<dyn ShardStrategy> {
        match self {
            Self::JavaLongHash => Box::new(JavaLongHashMod),
            Self::PlainModulo => Box::new(PlainModulo),
        }
    }
}

/// Produces identifiers that a [`ShardStrategy`] routes to a requested shard.
///
/// The router owns a monotonically increasing candidate counter seeded from
/// the wall clock in nanoseconds, so successive calls (from any thread) never
/// hand out the same identifier.
#[derive(Debug)]
pub struct ShardRouter<S = JavaLongHashMod> {
    strategy: S,
    next_candidate: AtomicU64,
    max_attempts: u64,
}

impl ShardRouter<JavaLongHashMod> {
    /// Router using the JVM `Long.hashCode` scheme.
    pub fn new() -> Self {
        Self::with_strategy(JavaLongHashMod)
    }
}

impl Default for ShardRouter<JavaLongHashMod> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ShardRouter<S>
where
    S: ShardStrategy,
{
    pub fn with_strategy(strategy: S) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            strategy,
            next_candidate: AtomicU64::new(seed),
            max_attempts: DEFAULT_MAX_ROUTING_ATTEMPTS,
        }
    }

    /// Restarts the candidate counter at `seed`. Routing from a fixed seed is
    /// fully deterministic.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        self.next_candidate.store(seed, Ordering::Relaxed);
        self
    }

    /// Sets the per-call probe ceiling.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u64) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Returns an identifier `i` such that `strategy.shard_of(i, shard_count)
    /// == target`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `shard_count` is zero or `target` is out
    ///   of range.
    /// - [`Error::RoutingExhausted`] if no candidate matched within the probe
    ///   ceiling.
    pub fn route_to_shard(&self, shard_count: u32, target: u32) -> Result<Identifier> {
        validate(shard_count, target)?;

        for _ in 0..self.max_attempts {
            let candidate = self.next_candidate.fetch_add(1, Ordering::Relaxed);
            if self.strategy.shard_of(candidate, shard_count) == Some(target) {
                return Ok(Identifier::from_u64(candidate));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            shard_count,
            target,
            attempts = self.max_attempts,
            "routing exhausted"
        );
        Err(Error::RoutingExhausted {
            shard_count,
            target,
            attempts: self.max_attempts,
        })
    }

    /// Routes `count` distinct identifiers onto `target`.
    ///
    /// # Errors
    ///
    /// Same as [`route_to_shard`](Self::route_to_shard); the first failure
    /// aborts the batch.
    pub fn route_many(&self, count: usize, shard_count: u32, target: u32) -> Result<Vec<Identifier>> {
        (0..count)
            .map(|_| self.route_to_shard(shard_count, target))
            .collect()
    }

    /// Shard an existing identifier maps to under this router's strategy.
    pub fn shard_of(&self, identifier: &Identifier, shard_count: u32) -> Option<u32> {
        identifier
            .as_u64()
            .and_then(|value| self.strategy.shard_of(value, shard_count))
    }
}

fn validate(shard_count: u32, target: u32) -> Result<()> {
    if shard_count == 0 {
        return Err(Error::config("shard count must be greater than 0"));
    }
    if target >= shard_count {
        return Err(Error::config(format!(
            "target shard {target} is out of range for {shard_count} shards"
        )));
    }
    Ok(())
}
