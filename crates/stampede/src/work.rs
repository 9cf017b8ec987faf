use crate::{Identifier, TemplateHandle};
use core::fmt;

/// Sequence number assigned to a [`WorkUnit`] when a burst is planned.
///
/// Every unit yields exactly one [`Outcome`](crate::Outcome) carrying the same
/// id, which is what makes "one outcome per unit" checkable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The external operation a unit performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum OperationKind {
    /// Redemption acknowledged before persistence; rows appear once the
    /// message queue is consumed.
    RedeemAsync,
    /// Redemption that returns only after a durable commit.
    RedeemSync,
    /// Template creation. Bursts of this kind share one request, so the
    /// unit's template handle is the dedup key rather than an existing
    /// template.
    CreateTemplate,
    /// Template lookup through the engine's cache layers.
    QueryTemplate,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RedeemAsync => "redeem-async",
            Self::RedeemSync => "redeem-sync",
            Self::CreateTemplate => "create-template",
            Self::QueryTemplate => "query-template",
        };
        f.write_str(name)
    }
}

/// One planned operation. Immutable once enqueued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: UnitId,
    pub identifier: Identifier,
    pub template: TemplateHandle,
    pub kind: OperationKind,
}

/// Plans one unit per identifier, numbering them in order.
pub fn plan_units(
    identifiers: impl IntoIterator<Item = Identifier>,
    template: &TemplateHandle,
    kind: OperationKind,
) -> Vec<WorkUnit> {
    identifiers
        .into_iter()
        .enumerate()
        .map(|(seq, identifier)| WorkUnit {
            id: UnitId(seq as u64),
            identifier,
            template: template.clone(),
            kind,
        })
        .collect()
}

/// Plans `count` identical units, as used by idempotency and hot-key bursts
/// where every request shares the same key.
pub fn plan_identical(
    count: usize,
    identifier: &Identifier,
    template: &TemplateHandle,
    kind: OperationKind,
) -> Vec<WorkUnit> {
    plan_units(
        core::iter::repeat_n(identifier.clone(), count),
        template,
        kind,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_are_numbered_in_order() {
        let template = TemplateHandle::new("t-1");
        let units = plan_units(
            [Identifier::from_u64(7), Identifier::from_u64(9)],
            &template,
            OperationKind::RedeemAsync,
        );
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id, UnitId(0));
        assert_eq!(units[1].id, UnitId(1));
        assert_eq!(units[1].identifier.as_str(), "9");
        assert!(units.iter().all(|u| u.template == template));
    }

    #[test]
    fn identical_plans_share_the_key() {
        let units = plan_identical(
            4,
            &Identifier::new("dup"),
            &TemplateHandle::new("name"),
            OperationKind::CreateTemplate,
        );
        assert_eq!(units.len(), 4);
        assert!(units.iter().all(|u| u.identifier.as_str() == "dup"));
        assert_eq!(units[3].id, UnitId(3));
    }
}
