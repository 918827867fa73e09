//! Profile and partition-filter types.
//!
//! A [`Profile`] groups the application models that sync together; a
//! [`Filter`] is the ordered set of partition prefixes a `Store` row must
//! match to be in scope for a given sync.

/// Named set of application models that sync together.
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Profile(String);

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Profile {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque partition prefix used to shard and filter syncable records.
///
/// Crosses a trust boundary (it is attacker-influenced on the peer that
/// requests a sync), so it is never string-interpolated into SQL - every
/// comparison goes through a parameterized `LIKE prefix%` query or, for the
/// in-process checks here, plain [`str::starts_with`].
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition(String);

impl Partition {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Does `partition` fall under this prefix?
    pub fn matches(&self, partition: &str) -> bool {
        partition.starts_with(self.as_str())
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Partition {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// An ordered set of partition prefixes. Empty means "everything".
#[cfg_attr(feature = "bincode", derive(::bincode::Encode, ::bincode::Decode))]
#[cfg_attr(feature = "serde", derive(::serde::Serialize, ::serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter(Vec<Partition>);

impl Filter {
    pub fn everything() -> Self {
        Self(Vec::new())
    }

    pub fn new(prefixes: impl IntoIterator<Item = Partition>) -> Self {
        Self(prefixes.into_iter().collect())
    }

    pub fn is_everything(&self) -> bool {
        self.0.is_empty()
    }

    pub fn prefixes(&self) -> &[Partition] {
        &self.0
    }

    /// Does `partition` match this filter? An empty filter matches anything.
    pub fn matches(&self, partition: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p.matches(partition))
    }
}

impl FromIterator<Partition> for Filter {
    fn from_iter<T: IntoIterator<Item = Partition>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let f = Filter::everything();
        assert!(f.matches("facility/abc"));
        assert!(f.is_everything());
    }

    #[test]
    fn filter_matches_prefix() {
        let f = Filter::new([Partition::new("facility"), Partition::new("user/42")]);
        assert!(f.matches("facility/abc"));
        assert!(f.matches("user/42/log/1"));
        assert!(!f.matches("user/7/log/1"));
    }
}
