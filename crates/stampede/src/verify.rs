//! Invariant checks over aggregated results.
//!
//! Every check is a pure function returning `Result<(), Violation>`. A
//! [`VerdictSet`] records them under a name without short-circuiting, so a
//! scenario reports every broken invariant at once.

use crate::{ApiResponse, Error, OutcomeSnapshot, ReconcileReport, Result};
use core::{fmt, time::Duration};

/// Message fragments the platform uses for duplicate-submission rejections.
pub const DUPLICATE_MARKERS: &[&str] = &["重复", "duplicate"];
/// Message fragments the platform uses for unknown templates.
pub const NOT_FOUND_MARKERS: &[&str] = &["不存在", "not exist", "not found"];
/// Result code for unknown templates.
pub const NOT_FOUND_CODE: &str = "A000001";

/// Why a check did not pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Violation {
    Failed(String),
    /// The side effect the check depends on was never observed.
    NotConverged { signal: String, waited: Duration },
}

impl Violation {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

impl From<Error> for Violation {
    fn from(err: Error) -> Self {
        match err {
            Error::NotConverged { signal, waited, .. } => Self::NotConverged { signal, waited },
            other => Self::Failed(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(tag = "status", rename_all = "kebab-case"))]
pub enum VerdictStatus {
    Passed,
    Failed { reason: String },
    NotConverged { signal: String, waited: Duration },
}

/// Named result of one invariant check.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Verdict {
    pub name: String,
    pub status: VerdictStatus,
}

impl Verdict {
    pub fn new(name: impl Into<String>, check: core::result::Result<(), Violation>) -> Self {
        let status = match check {
            Ok(()) => VerdictStatus::Passed,
            Err(Violation::Failed(reason)) => VerdictStatus::Failed { reason },
            Err(Violation::NotConverged { signal, waited }) => {
                VerdictStatus::NotConverged { signal, waited }
            }
        };
        Self {
            name: name.into(),
            status,
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == VerdictStatus::Passed
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            VerdictStatus::Passed => write!(f, "PASS  {}", self.name),
            VerdictStatus::Failed { reason } => write!(f, "FAIL  {}: {reason}", self.name),
            VerdictStatus::NotConverged { signal, waited } => write!(
                f,
                "WAIT  {}: `{signal}` not observed within {waited:?}",
                self.name
            ),
        }
    }
}

/// Ordered collection of verdicts, plus notes on what the run could not
/// observe without failing a check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct VerdictSet {
    verdicts: Vec<Verdict>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Vec::is_empty"))]
    notes: Vec<String>,
}

impl VerdictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `check` under `name` and returns whether it passed.
    pub fn record(
        &mut self,
        name: impl Into<String>,
        check: core::result::Result<(), Violation>,
    ) -> bool {
        let verdict = Verdict::new(name, check);
        let passed = verdict.is_passed();
        #[cfg(feature = "tracing")]
        {
            if passed {
                tracing::info!("{verdict}");
            } else {
                tracing::error!("{verdict}");
            }
        }
        self.verdicts.push(verdict);
        passed
    }

    /// Keeps `note` in the report. Notes never fail the run.
    pub fn note(&mut self, note: impl Into<String>) {
        let note = note.into();
        #[cfg(feature = "tracing")]
        tracing::warn!("{note}");
        self.notes.push(note);
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    pub fn extend(&mut self, other: Self) {
        self.verdicts.extend(other.verdicts);
        self.notes.extend(other.notes);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(Verdict::is_passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Verdict> {
        self.verdicts.iter().filter(|v| !v.is_passed())
    }

    /// # Errors
    ///
    /// [`Error::InvariantsViolated`] if any verdict failed.
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failures().count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(Error::InvariantsViolated {
                failed,
                total: self.len(),
            })
        }
    }
}

impl fmt::Display for VerdictSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for verdict in &self.verdicts {
            writeln!(f, "{verdict}")?;
        }
        for note in &self.notes {
            writeln!(f, "NOTE  {note}")?;
        }
        write!(
            f,
            "{} passed, {} failed",
            self.len() - self.failures().count(),
            self.failures().count()
        )
    }
}

/// Result of a single invariant check.
pub type Check = core::result::Result<(), Violation>;

fn ensure(condition: bool, reason: impl FnOnce() -> String) -> Check {
    if condition {
        Ok(())
    } else {
        Err(Violation::Failed(reason()))
    }
}

/// Successful redemptions never exceed `capacity`, reach it once the burst is
/// known to have converged, and no identifier succeeds twice. Every broken
/// condition is named in the reason.
pub fn check_conservation(snapshot: &OutcomeSnapshot, capacity: u64, converged: bool) -> Check {
    let successes = snapshot.success_count() as u64;
    let mut reasons = Vec::new();
    if successes > capacity {
        reasons.push(format!(
            "oversold: {successes} successes for capacity {capacity}"
        ));
    }
    let repeated = snapshot.repeated_successes();
    if let Some(first) = repeated.first() {
        reasons.push(format!(
            "{} identifiers redeemed more than once (first: {first})",
            repeated.len()
        ));
    }
    if snapshot.rejected_writes() > 0 {
        reasons.push(format!(
            "{} units produced a second outcome",
            snapshot.rejected_writes()
        ));
    }
    if converged {
        let expected = capacity.min(snapshot.len() as u64);
        if successes < expected {
            reasons.push(format!(
                "stock not exhausted: {successes} successes, expected {expected}"
            ));
        }
    }
    if reasons.is_empty() {
        Ok(())
    } else {
        Err(Violation::Failed(reasons.join("; ")))
    }
}

/// Exactly one of N ≥ 2 identical requests succeeds; the rest are rejected
/// with a duplicate-submission message.
pub fn check_idempotency(snapshot: &OutcomeSnapshot, markers: &[&str]) -> Check {
    ensure(snapshot.len() >= 2, || {
        format!("needs at least 2 identical requests, got {}", snapshot.len())
    })?;
    let successes = snapshot.success_count();
    ensure(successes == 1, || {
        format!("{successes} of {} identical requests succeeded", snapshot.len())
    })?;
    let unexplained: Vec<String> = snapshot
        .iter()
        .filter(|o| !o.success && !o.message_contains_any(markers))
        .map(|o| {
            format!(
                "{} ({})",
                o.unit,
                o.message.as_deref().unwrap_or("no message")
            )
        })
        .collect();
    ensure(unexplained.is_empty(), || {
        format!(
            "{} rejections lack a duplicate-submission signal: {}",
            unexplained.len(),
            unexplained.join(", ")
        )
    })
}

fn is_not_found(response: &ApiResponse) -> bool {
    !response.is_success()
        && (response.code.as_deref() == Some(NOT_FOUND_CODE)
            || response.message_contains_any(NOT_FOUND_MARKERS))
}

/// The membership filter rejected an unknown key before it reached the
/// negative cache.
pub fn check_penetration_blocked(response: &ApiResponse, null_entry_present: bool) -> Check {
    ensure(is_not_found(response), || {
        format!(
            "unknown template was not rejected: code {:?}, message {:?}",
            response.code, response.message
        )
    })?;
    ensure(!null_entry_present, || {
        "a negative cache entry was written; the membership filter let the key through".into()
    })
}

/// One lookup and how long it took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimedLookup {
    pub response: ApiResponse,
    pub elapsed: Duration,
}

/// After a forged filter false positive, the first miss writes a negative
/// entry and the second lookup is served from it.
///
/// `store_queries`, when the backing store's query count is observable, must
/// show exactly one query across both lookups.
pub fn check_negative_cache(
    first: &TimedLookup,
    second: &TimedLookup,
    null_entry_present: bool,
    store_queries: Option<u64>,
) -> Check {
    ensure(is_not_found(&first.response), || {
        format!("first lookup was not a miss: {:?}", first.response.message)
    })?;
    ensure(null_entry_present, || {
        "no negative cache entry after a miss; the store is unprotected".into()
    })?;
    ensure(is_not_found(&second.response), || {
        format!("second lookup was not a miss: {:?}", second.response.message)
    })?;
    ensure(second.elapsed <= first.elapsed, || {
        format!(
            "second lookup ({:?}) was slower than the first ({:?})",
            second.elapsed, first.elapsed
        )
    })?;
    if let Some(queries) = store_queries {
        ensure(queries == 1, || {
            format!("{queries} store queries for two lookups, expected 1")
        })?;
    }
    Ok(())
}

/// Under a miss storm for a hot key every client succeeds and the cache ends
/// up rebuilt (exactly once when the rebuild count is observable).
pub fn check_breakdown_rebuild(
    snapshot: &OutcomeSnapshot,
    cache_rebuilt: bool,
    rebuilds: Option<u64>,
) -> Check {
    let failures = snapshot.failure_count();
    ensure(failures == 0, || {
        format!("{failures} of {} concurrent lookups failed", snapshot.len())
    })?;
    ensure(cache_rebuilt, || "cache entry was not rebuilt".into())?;
    if let Some(rebuilds) = rebuilds {
        ensure(rebuilds == 1, || {
            format!("cache rebuilt {rebuilds} times, expected once")
        })?;
    }
    Ok(())
}

/// Persisted rows across the reachable shards equal `expected`.
pub fn check_reconciliation(report: &ReconcileReport, expected: u64) -> Check {
    ensure(report.counted() > 0, || {
        format!("none of {} shard tables could be counted", report.table_count)
    })?;
    ensure(report.total == expected, || {
        let gaps: Vec<String> = report
            .unreachable
            .iter()
            .map(|(shard, _)| shard.to_string())
            .collect();
        if gaps.is_empty() {
            format!("{} rows persisted, expected {expected}", report.total)
        } else {
            format!(
                "{} rows persisted, expected {expected} (unreachable shards: {})",
                report.total,
                gaps.join(", ")
            )
        }
    })
}

/// A successful synchronous redemption is immediately visible as one row.
pub fn check_strong_consistency(response: &ApiResponse, rows: u64) -> Check {
    ensure(response.is_success(), || {
        format!(
            "redemption failed: status {}, code {:?}, message {:?}",
            response.status, response.code, response.message
        )
    })?;
    ensure(rows == 1, || format!("{rows} rows visible right after commit, expected 1"))
}

/// The remaining stock counter is at or below zero.
pub fn check_stock_exhausted(stock: Option<&str>) -> Check {
    let Some(raw) = stock else {
        return Err(Violation::failed("stock counter is missing"));
    };
    let remaining: i64 = raw
        .trim()
        .parse()
        .map_err(|_| Violation::failed(format!("stock counter {raw:?} is not an integer")))?;
    ensure(remaining <= 0, || {
        format!("{remaining} units left; stock was not exhausted")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        plan_identical, Identifier, OperationKind, Outcome, OutcomeSet, TemplateHandle,
    };

    fn snapshot_of(responses: Vec<ApiResponse>) -> OutcomeSnapshot {
        let units = plan_identical(
            responses.len(),
            &Identifier::new("u"),
            &TemplateHandle::new("t"),
            OperationKind::CreateTemplate,
        );
        let set = OutcomeSet::default();
        for (unit, response) in units.iter().zip(responses) {
            set.record(Outcome::from_response(unit, response, Duration::ZERO));
        }
        set.snapshot()
    }

    fn redemptions(successes: usize, rejections: usize) -> OutcomeSnapshot {
        let set = OutcomeSet::default();
        let units = crate::plan_units(
            (0..(successes + rejections) as u64).map(Identifier::from_u64),
            &TemplateHandle::new("t"),
            OperationKind::RedeemAsync,
        );
        for (i, unit) in units.iter().enumerate() {
            let response = if i < successes {
                ApiResponse::ok(None)
            } else {
                ApiResponse::rejected("A000002", "库存不足")
            };
            set.record(Outcome::from_response(unit, response, Duration::ZERO));
        }
        set.snapshot()
    }

    #[test]
    fn conservation_holds_at_capacity() {
        assert_eq!(check_conservation(&redemptions(10, 40), 10, true), Ok(()));
        assert_eq!(check_conservation(&redemptions(7, 43), 10, false), Ok(()));
    }

    #[test]
    fn conservation_detects_oversell_and_undersell() {
        assert!(matches!(
            check_conservation(&redemptions(11, 39), 10, false),
            Err(Violation::Failed(reason)) if reason.contains("oversold")
        ));
        assert!(matches!(
            check_conservation(&redemptions(9, 41), 10, true),
            Err(Violation::Failed(reason)) if reason.contains("not exhausted")
        ));
    }

    #[test]
    fn conservation_rejects_repeat_winners() {
        let set = OutcomeSet::default();
        let units = plan_identical(
            2,
            &Identifier::new("5"),
            &TemplateHandle::new("t"),
            OperationKind::RedeemAsync,
        );
        for unit in &units {
            set.record(Outcome::from_response(unit, ApiResponse::ok(None), Duration::ZERO));
        }
        assert!(check_conservation(&set.snapshot(), 10, false).is_err());
    }

    #[test]
    fn conservation_names_every_broken_condition() {
        let set = OutcomeSet::default();
        let units = plan_identical(
            3,
            &Identifier::new("5"),
            &TemplateHandle::new("t"),
            OperationKind::RedeemAsync,
        );
        for unit in &units {
            set.record(Outcome::from_response(unit, ApiResponse::ok(None), Duration::ZERO));
        }

        let Err(Violation::Failed(reason)) = check_conservation(&set.snapshot(), 2, true) else {
            panic!("oversold burst with a repeat winner passed");
        };
        assert!(reason.contains("oversold: 3 successes for capacity 2"), "{reason}");
        assert!(reason.contains("redeemed more than once (first: 5)"), "{reason}");
        assert!(!reason.contains("not exhausted"), "{reason}");
    }

    #[test]
    fn idempotency_requires_one_winner_and_duplicate_signals() {
        let mut responses = vec![ApiResponse::ok(Some("t-1".into()))];
        responses.extend((0..19).map(|_| ApiResponse::rejected("B000001", "请勿重复提交")));
        assert_eq!(check_idempotency(&snapshot_of(responses), DUPLICATE_MARKERS), Ok(()));

        let two_winners = vec![ApiResponse::ok(None), ApiResponse::ok(None)];
        assert!(check_idempotency(&snapshot_of(two_winners), DUPLICATE_MARKERS).is_err());

        let wrong_reason = vec![
            ApiResponse::ok(None),
            ApiResponse::rejected("B000002", "server busy"),
        ];
        assert!(matches!(
            check_idempotency(&snapshot_of(wrong_reason), DUPLICATE_MARKERS),
            Err(Violation::Failed(reason)) if reason.contains("server busy")
        ));
    }

    #[test]
    fn penetration_requires_rejection_without_null_entry() {
        let miss = ApiResponse::rejected(NOT_FOUND_CODE, "优惠券模板不存在");
        assert_eq!(check_penetration_blocked(&miss, false), Ok(()));
        assert!(check_penetration_blocked(&miss, true).is_err());
        assert!(check_penetration_blocked(&ApiResponse::ok(None), false).is_err());
    }

    #[test]
    fn negative_cache_second_hit_must_not_be_slower() {
        let miss = ApiResponse::rejected(NOT_FOUND_CODE, "template not exist");
        let first = TimedLookup {
            response: miss.clone(),
            elapsed: Duration::from_millis(40),
        };
        let fast = TimedLookup {
            response: miss.clone(),
            elapsed: Duration::from_millis(2),
        };
        assert_eq!(check_negative_cache(&first, &fast, true, Some(1)), Ok(()));
        assert!(check_negative_cache(&first, &fast, false, None).is_err());
        assert!(check_negative_cache(&first, &fast, true, Some(2)).is_err());

        let slow = TimedLookup {
            response: miss,
            elapsed: Duration::from_millis(90),
        };
        assert!(check_negative_cache(&first, &slow, true, None).is_err());
    }

    #[test]
    fn reconciliation_names_unreachable_shards() {
        let report = ReconcileReport {
            table_count: 4,
            per_shard: vec![(0, 3), (1, 2), (3, 0)],
            unreachable: vec![(2, crate::CollaboratorError::Unavailable("t_2".into()))],
            total: 5,
        };
        assert_eq!(check_reconciliation(&report, 5), Ok(()));
        assert!(matches!(
            check_reconciliation(&report, 6),
            Err(Violation::Failed(reason)) if reason.contains("unreachable shards: 2")
        ));
        assert!(check_reconciliation(&ReconcileReport::default(), 0).is_err());
    }

    #[test]
    fn stock_counter_must_be_drained() {
        assert_eq!(check_stock_exhausted(Some("0")), Ok(()));
        assert_eq!(check_stock_exhausted(Some("-3")), Ok(()));
        assert!(check_stock_exhausted(Some("12")).is_err());
        assert!(check_stock_exhausted(Some("lots")).is_err());
        assert!(check_stock_exhausted(None).is_err());
    }

    #[test]
    fn verdict_set_collects_every_failure() {
        let mut verdicts = VerdictSet::new();
        assert!(verdicts.record("a", Ok(())));
        assert!(!verdicts.record("b", Err(Violation::failed("broken"))));
        assert!(!verdicts.record(
            "c",
            Err(Error::NotConverged {
                signal: "rows".into(),
                waited: Duration::from_secs(30),
                attempts: 30,
            }
            .into()),
        ));

        assert_eq!(verdicts.len(), 3);
        assert!(!verdicts.all_passed());
        let names: Vec<&str> = verdicts.failures().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["b", "c"]);
        assert!(matches!(
            verdicts.iter().nth(2).map(|v| &v.status),
            Some(VerdictStatus::NotConverged { .. })
        ));
        assert!(verdicts.to_string().ends_with("1 passed, 2 failed"));
        assert!(matches!(
            verdicts.into_result(),
            Err(Error::InvariantsViolated {
                failed: 2,
                total: 3
            })
        ));
    }

    #[test]
    fn notes_are_reported_without_failing_the_run() {
        let mut verdicts = VerdictSet::new();
        verdicts.record("rows", Ok(()));
        verdicts.note("1 of 32 shard tables not counted: 31 (unavailable)");

        let mut merged = VerdictSet::new();
        merged.extend(verdicts);
        assert!(merged.all_passed());
        assert_eq!(merged.notes().len(), 1);
        let rendered = merged.to_string();
        assert!(
            rendered.contains("NOTE  1 of 32 shard tables not counted"),
            "{rendered}"
        );
        assert!(rendered.ends_with("1 passed, 0 failed"));
    }
}
