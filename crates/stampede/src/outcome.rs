//! Per-unit outcomes and their concurrent aggregation.
//!
//! [`OutcomeSet`] is the only structure mutated by many workers at once. It
//! holds outcomes keyed by [`UnitId`] behind a mutex and keeps success/failure
//! tallies in atomics so progress can be sampled without taking the lock.
//! Once a run drains, [`OutcomeSet::snapshot`] produces an immutable
//! [`OutcomeSnapshot`] for the verifier.

use crate::{ApiResponse, CollaboratorError, Identifier, OperationKind, UnitId, WorkUnit};
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Code recorded when the call never produced a response.
pub const CODE_TRANSPORT: &str = "HARNESS_TRANSPORT";
/// Code recorded when a unit was cancelled before or during execution.
pub const CODE_CANCELLED: &str = "HARNESS_CANCELLED";
/// Code recorded when the executor panicked.
pub const CODE_PANICKED: &str = "HARNESS_PANICKED";

/// Result of executing one [`WorkUnit`]. Written once, read-only afterward.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Outcome {
    pub unit: UnitId,
    pub kind: OperationKind,
    pub identifier: Identifier,
    pub success: bool,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub data: Option<String>,
    pub elapsed: Duration,
}

impl Outcome {
    pub fn from_response(unit: &WorkUnit, response: ApiResponse, elapsed: Duration) -> Self {
        Self {
            unit: unit.id,
            kind: unit.kind,
            identifier: unit.identifier.clone(),
            success: response.is_success(),
            status: Some(response.status),
            code: response.code,
            message: response.message,
            data: response.data,
            elapsed,
        }
    }

    pub fn from_error(unit: &WorkUnit, error: &CollaboratorError, elapsed: Duration) -> Self {
        Self::harness_failure(unit, CODE_TRANSPORT, error.to_string(), elapsed)
    }

    pub fn cancelled(unit: &WorkUnit, elapsed: Duration) -> Self {
        Self::harness_failure(unit, CODE_CANCELLED, "cancelled before completion", elapsed)
    }

    pub fn panicked(unit: &WorkUnit, message: String, elapsed: Duration) -> Self {
        Self::harness_failure(unit, CODE_PANICKED, message, elapsed)
    }

    fn harness_failure(
        unit: &WorkUnit,
        code: &str,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            unit: unit.id,
            kind: unit.kind,
            identifier: unit.identifier.clone(),
            success: false,
            status: None,
            code: Some(code.to_string()),
            message: Some(message.into()),
            data: None,
            elapsed,
        }
    }

    /// Case-insensitive check of the message against any of `markers`.
    pub fn message_contains_any(&self, markers: &[&str]) -> bool {
        let Some(message) = self.message.as_deref() else {
            return false;
        };
        let lowered = message.to_lowercase();
        markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.code.as_deref() == Some(CODE_CANCELLED)
    }
}

#[derive(Default)]
struct Inner {
    by_unit: HashMap<UnitId, Outcome>,
    successful: HashSet<Identifier>,
    repeated_successes: Vec<Identifier>,
}

/// Thread-safe collection point for outcomes produced by concurrent workers.
#[derive(Default)]
pub struct OutcomeSet {
    inner: Mutex<Inner>,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    rejected_writes: AtomicUsize,
}

impl OutcomeSet {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_unit: HashMap::with_capacity(capacity),
                successful: HashSet::with_capacity(capacity),
                repeated_successes: Vec::new(),
            }),
            ..Self::default()
        }
    }

    /// Records `outcome`. Returns `false` (and keeps the first write) if the
    /// unit already has an outcome.
    pub fn record(&self, outcome: Outcome) -> bool {
        let success = outcome.success;
        {
            let mut inner = self.inner.lock();
            if inner.by_unit.contains_key(&outcome.unit) {
                drop(inner);
                self.rejected_writes.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::error!(unit = %outcome.unit, "second outcome for unit rejected");
                return false;
            }
            if success && !inner.successful.insert(outcome.identifier.clone()) {
                inner.repeated_successes.push(outcome.identifier.clone());
            }
            inner.by_unit.insert(outcome.unit, outcome);
        }
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.succeeded() + self.failed()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current contents into an immutable snapshot.
    pub fn snapshot(&self) -> OutcomeSnapshot {
        let inner = self.inner.lock();
        let mut outcomes: Vec<Outcome> = inner.by_unit.values().cloned().collect();
        outcomes.sort_by_key(|o| o.unit);
        OutcomeSnapshot {
            outcomes,
            repeated_successes: inner.repeated_successes.clone(),
            rejected_writes: self.rejected_writes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of an [`OutcomeSet`], ordered by unit id.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct OutcomeSnapshot {
    outcomes: Vec<Outcome>,
    repeated_successes: Vec<Identifier>,
    rejected_writes: usize,
}

impl OutcomeSnapshot {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter()
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn failure_count(&self) -> usize {
        self.len() - self.success_count()
    }

    pub fn count_matching(&self, predicate: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(o)).count()
    }

    /// Identifiers that succeeded more than once.
    pub fn repeated_successes(&self) -> &[Identifier] {
        &self.repeated_successes
    }

    /// Writes rejected because the unit already had an outcome. Non-zero means
    /// the pool broke its exactly-once contract.
    pub fn rejected_writes(&self) -> usize {
        self.rejected_writes
    }

    /// Failure tally per result code, for diagnostics.
    pub fn failures_by_code(&self) -> BTreeMap<String, usize> {
        let mut tally = BTreeMap::new();
        for outcome in self.outcomes.iter().filter(|o| !o.success) {
            let code = outcome.code.clone().unwrap_or_else(|| "<none>".to_string());
            *tally.entry(code).or_insert(0) += 1;
        }
        tally
    }

    /// Median and maximum latency over all outcomes.
    pub fn latency_summary(&self) -> Option<(Duration, Duration)> {
        let mut elapsed: Vec<Duration> = self.outcomes.iter().map(|o| o.elapsed).collect();
        if elapsed.is_empty() {
            return None;
        }
        elapsed.sort_unstable();
        Some((elapsed[elapsed.len() / 2], elapsed[elapsed.len() - 1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TemplateHandle;
    use std::sync::Arc;

    fn unit(seq: u64, identifier: &str) -> WorkUnit {
        WorkUnit {
            id: UnitId(seq),
            identifier: Identifier::new(identifier),
            template: TemplateHandle::new("t"),
            kind: OperationKind::RedeemAsync,
        }
    }

    #[test]
    fn second_write_for_a_unit_is_rejected() {
        let set = OutcomeSet::default();
        let u = unit(0, "1");
        assert!(set.record(Outcome::from_response(&u, ApiResponse::ok(None), Duration::ZERO)));
        assert!(!set.record(Outcome::cancelled(&u, Duration::ZERO)));

        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.success_count(), 1);
        assert_eq!(snapshot.rejected_writes(), 1);
    }

    #[test]
    fn repeated_success_for_an_identifier_is_tracked() {
        let set = OutcomeSet::default();
        set.record(Outcome::from_response(&unit(0, "7"), ApiResponse::ok(None), Duration::ZERO));
        set.record(Outcome::from_response(&unit(1, "7"), ApiResponse::ok(None), Duration::ZERO));
        set.record(Outcome::from_response(
            &unit(2, "8"),
            ApiResponse::rejected("A1", "sold out"),
            Duration::ZERO,
        ));

        let snapshot = set.snapshot();
        assert_eq!(snapshot.repeated_successes(), &[Identifier::new("7")]);
        assert_eq!(snapshot.failures_by_code().get("A1"), Some(&1));
    }

    #[test]
    fn concurrent_records_are_all_kept() {
        let set = Arc::new(OutcomeSet::with_capacity(8_000));
        std::thread::scope(|s| {
            for t in 0..8_u64 {
                let set = Arc::clone(&set);
                s.spawn(move || {
                    for i in 0..1_000_u64 {
                        let seq = t * 1_000 + i;
                        let u = unit(seq, &seq.to_string());
                        let response = if seq % 2 == 0 {
                            ApiResponse::ok(None)
                        } else {
                            ApiResponse::rejected("A1", "no")
                        };
                        assert!(set.record(Outcome::from_response(&u, response, Duration::ZERO)));
                    }
                });
            }
        });

        assert_eq!(set.succeeded(), 4_000);
        assert_eq!(set.failed(), 4_000);
        let snapshot = set.snapshot();
        assert_eq!(snapshot.len(), 8_000);
        assert!(snapshot.iter().zip(0..).all(|(o, i)| o.unit == UnitId(i)));
    }

    #[test]
    fn transport_errors_become_failed_outcomes() {
        let u = unit(3, "9");
        let outcome = Outcome::from_error(
            &u,
            &CollaboratorError::Transport("connection reset".into()),
            Duration::from_millis(4),
        );
        assert!(!outcome.success);
        assert_eq!(outcome.code.as_deref(), Some(CODE_TRANSPORT));
        assert!(outcome.message_contains_any(&["RESET"]));
        assert_eq!(outcome.status, None);
    }
}
