use core::fmt;
use rand::Rng;
use std::collections::HashSet;

/// Opaque numeric string identifying a user or entity in the external system.
///
/// Identifiers are generated per run and never reused across scenarios. The
/// harness does not persist them; persistence happens in the system under
/// test.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Identifier(String);

impl Identifier {
    /// Wraps a raw numeric value.
    pub fn from_u64(value: u64) -> Self {
        Self(value.to_string())
    }

    /// Wraps an already-rendered identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the identifier back into its numeric form, if it has one.
    pub fn as_u64(&self) -> Option<u64> {
        self.0.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Generates `count` distinct random 19-digit identifiers, mimicking
    /// Snowflake-style user ids.
    ///
    /// Use this for bursts that only need uniqueness. Use
    /// [`ShardRouter`](crate::ShardRouter) when the identifier must land on a
    /// specific shard.
    pub fn random_unique(count: usize) -> Vec<Self> {
        const LOW: u64 = 1_000_000_000_000_000_000;
        let mut rng = rand::rng();
        let mut seen = HashSet::with_capacity(count);
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let candidate = rng.random_range(LOW..=u64::MAX / 2);
            if seen.insert(candidate) {
                out.push(Self::from_u64(candidate));
            }
        }
        out
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque handle of a coupon template created as fixture data.
///
/// The handle is owned by the scenario that created it and stays valid until
/// the scenario ends. The external system is append-only from the harness's
/// point of view, so there is no teardown.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TemplateHandle(String);

impl TemplateHandle {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TemplateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
