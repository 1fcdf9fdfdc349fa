//! Shard Filter
//!
//! Decides whether this node is responsible for a resource key.
//!
//! # Hash
//!
//! The shard of a key is `abs(hash) % total_shards` where `hash` is the
//! 32-bit polynomial hash that existing nodes of the cluster compute
//! (`31 * (31 + h(directory)) + h(filename)`, with `h` the classic
//! `s[0]*31^(n-1) + ... + s[n-1]` string hash over UTF-16 code units and
//! wrapping arithmetic throughout). It has no per-process seed, so every
//! node agrees on the shard of every key.
//!
//! `abs(i32::MIN)` stays negative under wrapping semantics, so for that one
//! hash the remainder is `-(2^31 mod total_shards)`. It is zero, and the key
//! lands on shard 0, when `total_shards` divides 2^31 (any power of two);
//! for every other shard count the remainder is negative and no node claims
//! the key. This mirrors the deployed behaviour.

use std::collections::BTreeSet;

use crate::domain::ResourceKey;

/// Which parts of the key feed the shard hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ShardHashScope {
    /// Directory and filename only; compatible with existing deployments.
    /// Identical directory/filename pairs under different origins share a
    /// shard.
    #[default]
    Legacy,
    /// Origin-qualified directory and filename.
    Origin,
}

/// Static shard membership of this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardAssignment {
    total_shards: u32,
    local_shards: BTreeSet<u32>,
}

impl ShardAssignment {
    /// `total_shards` must be non-zero and at most `i32::MAX`; callers
    /// validate configuration before building an assignment.
    pub fn new(total_shards: u32, local_shards: impl IntoIterator<Item = u32>) -> Self {
        Self {
            total_shards,
            local_shards: local_shards.into_iter().collect(),
        }
    }

    pub fn total_shards(&self) -> u32 {
        self.total_shards
    }

    pub fn local_shards(&self) -> &BTreeSet<u32> {
        &self.local_shards
    }
}

/// Pure, side-effect-free responsibility check.
#[derive(Debug, Clone, Default)]
pub struct ShardFilter {
    /// `None` when sharding is disabled
    assignment: Option<ShardAssignment>,
    scope: ShardHashScope,
}

impl ShardFilter {
    /// Sharding off: every key is local.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn enabled(assignment: ShardAssignment, scope: ShardHashScope) -> Self {
        Self {
            assignment: Some(assignment),
            scope,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.assignment.is_some()
    }

    /// Whether this node handles `key`.
    pub fn is_responsible(&self, key: &ResourceKey) -> bool {
        let Some(assignment) = &self.assignment else {
            return true;
        };
        match shard_of(key, assignment.total_shards, self.scope) {
            Some(shard) => assignment.local_shards.contains(&shard),
            None => false,
        }
    }
}

/// Shard id of a key. `None` only when the hash is `i32::MIN` and
/// `total_shards` does not divide 2^31.
pub fn shard_of(key: &ResourceKey, total_shards: u32, scope: ShardHashScope) -> Option<u32> {
    let directory = match scope {
        ShardHashScope::Legacy => key.directory(),
        ShardHashScope::Origin => format!("{}/{}", key.origin(), key.directory()),
    };
    shard_of_hash(combined_hash(&directory, key.filename()), total_shards)
}

fn shard_of_hash(hash: i32, total_shards: u32) -> Option<u32> {
    let shard = i64::from(hash.wrapping_abs()) % i64::from(total_shards);
    u32::try_from(shard).ok()
}

/// Polynomial string hash over UTF-16 code units.
fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Combined hash of two strings, seeded with 1.
fn combined_hash(first: &str, second: &str) -> i32 {
    [first, second]
        .iter()
        .fold(1i32, |acc, s| acc.wrapping_mul(31).wrapping_add(string_hash(s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Origin;
    use proptest::prelude::*;

    fn key(origin: Origin, dir: &[&str], file: &str) -> ResourceKey {
        ResourceKey::new(origin, dir.iter().map(|s| s.to_string()).collect(), file)
    }

    #[test]
    fn test_string_hash_known_values() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("abc"), 96354);
        assert_eq!(string_hash("12345"), 46792755);
        assert_eq!(string_hash("abc123.mp4"), -161244525);
    }

    #[test]
    fn test_combined_hash_known_values() {
        assert_eq!(combined_hash("12345", "abc123.mp4"), 1289331841);
        assert_eq!(combined_hash("ab/cd", "abcdef.webm"), 332856022);
        assert_eq!(combined_hash("1", "a.mp4"), 91062676);
    }

    #[test]
    fn test_shard_of_known_values() {
        let k = key(Origin::Rule34, &["12345"], "abc123.mp4");
        assert_eq!(shard_of(&k, 7, ShardHashScope::Legacy), Some(0));
        assert_eq!(shard_of(&k, 4, ShardHashScope::Legacy), Some(1));

        let k = key(Origin::Danbooru, &["ab", "cd"], "abcdef.webm");
        assert_eq!(shard_of(&k, 7, ShardHashScope::Legacy), Some(2));
    }

    #[test]
    fn test_min_hash_depends_on_shard_count() {
        assert_eq!(shard_of_hash(i32::MIN, 1), Some(0));
        assert_eq!(shard_of_hash(i32::MIN, 4), Some(0));
        assert_eq!(shard_of_hash(i32::MIN, 1024), Some(0));
        assert_eq!(shard_of_hash(i32::MIN, 7), None);
        assert_eq!(shard_of_hash(i32::MIN, 12), None);
        assert_eq!(shard_of_hash(-5, 7), Some(5));
    }

    #[test]
    fn test_disabled_is_always_responsible() {
        let filter = ShardFilter::disabled();
        assert!(!filter.is_enabled());
        assert!(filter.is_responsible(&key(Origin::Rule34, &["1"], "a.mp4")));
    }

    #[test]
    fn test_membership() {
        let k = key(Origin::Rule34, &["12345"], "abc123.mp4");
        let owner = ShardFilter::enabled(ShardAssignment::new(4, [1]), ShardHashScope::Legacy);
        let other = ShardFilter::enabled(ShardAssignment::new(4, [0, 2, 3]), ShardHashScope::Legacy);
        assert!(owner.is_responsible(&k));
        assert!(!other.is_responsible(&k));
    }

    #[test]
    fn test_legacy_scope_ignores_origin() {
        let a = key(Origin::Danbooru, &["ab", "cd"], "x.mp4");
        let b = key(Origin::Realbooru, &["ab", "cd"], "x.mp4");
        assert_eq!(
            shard_of(&a, 16, ShardHashScope::Legacy),
            shard_of(&b, 16, ShardHashScope::Legacy)
        );
    }

    proptest! {
        #[test]
        fn prop_exactly_one_node_owns_each_key(
            dir in "[0-9]{1,8}",
            stem in "[a-z0-9]{1,16}",
            total in 1u32..32,
        ) {
            let k = key(Origin::Rule34, &[dir.as_str()], &format!("{stem}.mp4"));
            let owners = (0..total)
                .map(|id| ShardFilter::enabled(ShardAssignment::new(total, [id]), ShardHashScope::Origin))
                .filter(|f| f.is_responsible(&k))
                .count();
            prop_assert_eq!(owners, 1);
        }

        #[test]
        fn prop_shard_is_deterministic(dir in "[0-9a-f]{2}", file in "[a-z0-9]{1,16}") {
            let k = key(Origin::Danbooru, &[dir.as_str(), dir.as_str()], &file);
            prop_assert_eq!(
                shard_of(&k, 9, ShardHashScope::Legacy),
                shard_of(&k.clone(), 9, ShardHashScope::Legacy)
            );
        }
    }
}
