//! Cross-shard row reconciliation.

use crate::{CollaboratorError, Identifier, RowFilter, ShardStrategy, ShardedRowCounter, TemplateHandle};

/// Per-shard counts for one filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub table_count: u32,
    /// `(shard, rows)` for every table that answered.
    pub per_shard: Vec<(u32, u64)>,
    /// Tables that could not be counted. They are excluded from `total`.
    pub unreachable: Vec<(u32, CollaboratorError)>,
    pub total: u64,
}

impl ReconcileReport {
    /// Number of tables that answered.
    pub fn counted(&self) -> usize {
        self.per_shard.len()
    }

    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }

    /// The tables left out of `total`, with why, or `None` when every table
    /// answered.
    pub fn gaps(&self) -> Option<String> {
        if self.is_complete() {
            return None;
        }
        let tables: Vec<String> = self
            .unreachable
            .iter()
            .map(|(shard, e)| format!("{shard} ({e})"))
            .collect();
        Some(format!(
            "{} of {} shard tables not counted: {}",
            self.unreachable.len(),
            self.table_count,
            tables.join(", ")
        ))
    }
}

/// Sums matching rows across every table the counter exposes.
///
/// A table that fails to answer is logged, skipped and listed in
/// [`ReconcileReport::unreachable`]; it never contributes a silent zero.
pub async fn reconcile<C>(counter: &C, filter: &RowFilter) -> ReconcileReport
where
    C: ShardedRowCounter,
{
    let table_count = counter.table_count();
    let mut report = ReconcileReport {
        table_count,
        ..ReconcileReport::default()
    };

    for shard in 0..table_count {
        match counter.count(shard, filter).await {
            Ok(rows) => {
                report.per_shard.push((shard, rows));
                report.total += rows;
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Skipping shard table {shard}: {e}");
                report.unreachable.push((shard, e));
            }
        }
    }

    report
}

/// Counts the rows `identifier` holds for `template`, looking only at the
/// table `strategy` routes the identifier to.
///
/// # Errors
///
/// [`CollaboratorError::Protocol`] if the identifier is not numeric or maps
/// to no table; otherwise the counter's error.
pub async fn count_for<C, S>(
    counter: &C,
    strategy: &S,
    identifier: &Identifier,
    template: &TemplateHandle,
) -> Result<u64, CollaboratorError>
where
    C: ShardedRowCounter,
    S: ShardStrategy,
{
    let shard = identifier
        .as_u64()
        .and_then(|value| strategy.shard_of(value, counter.table_count()))
        .ok_or_else(|| {
            CollaboratorError::Protocol(format!("identifier {identifier} maps to no shard table"))
        })?;
    counter
        .count(shard, &RowFilter::identifier(template, identifier))
        .await
}
