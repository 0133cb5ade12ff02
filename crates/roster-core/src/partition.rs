//! # Search-Space Partition
//!
//! The upstream never shows more than [`RESULT_WINDOW`](crate::RESULT_WINDOW)
//! results for one query, so large result sets are sharded by the leading
//! characters of the email address, the one text field the upstream can
//! prefix-match.
//!
//! # Invariants
//!
//! - The 36 top-level buckets cover [`ALPHABET`] exactly once.
//! - A bucket's children extend its prefix by one [`REFINE_ALPHABET`]
//!   character, in that alphabet's order. Local parts may continue with
//!   `_`, `.` or `-` after their first character, so refinement covers
//!   those too.
//! - Prefixes never exceed [`MAX_PREFIX_LEN`] characters.
//!
//! These are proved for all inputs in `roster-verify`.

use std::fmt;

/// Characters a top-level prefix is drawn from, in lexicographic order.
pub const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Characters appended when a bucket is refined, in processing order.
pub const REFINE_ALPHABET: &[u8; 39] = b"_.-0123456789abcdefghijklmnopqrstuvwxyz";

/// Deepest supported refinement. Buckets at this depth that still reach the
/// result window are truncated, not split further.
pub const MAX_PREFIX_LEN: usize = 2;

/// A prefix shard of the search space. The empty prefix is the whole space.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bucket {
    prefix: String,
}

impl Bucket {
    /// The unpartitioned search space.
    pub fn root() -> Self {
        Self {
            prefix: String::new(),
        }
    }

    /// The 36 single-character buckets.
    pub fn top_level() -> Vec<Self> {
        ALPHABET
            .iter()
            .map(|&c| Self {
                prefix: (c as char).to_string(),
            })
            .collect()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_root(&self) -> bool {
        self.prefix.is_empty()
    }

    pub fn can_refine(&self) -> bool {
        self.depth() < MAX_PREFIX_LEN
    }

    /// The root splits into [`Bucket::top_level`]; any other bucket gets one
    /// child per [`REFINE_ALPHABET`] character. Empty once the depth bound is
    /// reached.
    pub fn children(&self) -> Vec<Self> {
        if !self.can_refine() {
            return Vec::new();
        }
        if self.is_root() {
            return Self::top_level();
        }
        REFINE_ALPHABET
            .iter()
            .map(|&c| {
                let mut prefix = String::with_capacity(self.prefix.len() + 1);
                prefix.push_str(&self.prefix);
                prefix.push(c as char);
                Self { prefix }
            })
            .collect()
    }

    /// Upstream wildcard pattern (`ab*`), or `None` for the root.
    pub fn pattern(&self) -> Option<String> {
        if self.is_root() {
            None
        } else {
            Some(format!("{}*", self.prefix))
        }
    }

    /// Position of the last prefix character in the alphabet it was drawn
    /// from. `None` for the root.
    pub fn rank(&self) -> Option<usize> {
        let last = *self.prefix.as_bytes().last()?;
        let alphabet: &[u8] = if self.depth() == 1 {
            ALPHABET
        } else {
            REFINE_ALPHABET
        };
        alphabet.iter().position(|&c| c == last)
    }

    /// Whether a value falls into this bucket (case-insensitive).
    pub fn contains(&self, value: &str) -> bool {
        value.to_ascii_lowercase().starts_with(&self.prefix)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_is_36_single_chars() {
        let top = Bucket::top_level();
        assert_eq!(top.len(), 36);
        assert_eq!(top[0].prefix(), "0");
        assert_eq!(top[10].prefix(), "a");
        assert_eq!(top[35].prefix(), "z");
        assert!(top.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_children_stop_at_depth_bound() {
        let a = &Bucket::top_level()[10];
        let kids = a.children();
        assert_eq!(kids.len(), 39);
        assert_eq!(kids[0].prefix(), "a_");
        assert_eq!(kids[1].prefix(), "a.");
        assert_eq!(kids[2].prefix(), "a-");
        assert_eq!(kids[3].prefix(), "a0");
        assert_eq!(kids[38].prefix(), "az");
        assert_eq!(
            kids.iter().map(|k| k.rank()).collect::<Vec<_>>(),
            (0..39).map(Some).collect::<Vec<_>>()
        );
        assert!(kids[0].children().is_empty());
        assert!(!kids[0].can_refine());
    }

    #[test]
    fn test_pattern_and_contains() {
        let root = Bucket::root();
        assert_eq!(root.pattern(), None);
        assert!(root.contains("anything"));

        let b = Bucket::top_level()[11].children()[4].clone();
        assert_eq!(b.pattern().as_deref(), Some("b1*"));
        assert!(b.contains("B1rd@example.com"));
        assert!(!b.contains("b2@example.com"));
        assert_eq!(b.to_string(), "b1*");
    }

    #[test]
    fn test_punctuated_local_parts_have_a_child() {
        let a = &Bucket::top_level()[10];
        for email in ["a.smith@x.com", "a_smith@x.com", "a-smith@x.com", "a0@x.com"] {
            let kids = a.children();
            assert_eq!(kids.iter().filter(|k| k.contains(email)).count(), 1, "{email}");
        }
    }

    #[test]
    fn test_root_refines_into_top_level() {
        assert_eq!(Bucket::root().children(), Bucket::top_level());
        assert_eq!(Bucket::root().rank(), None);
        assert_eq!(Bucket::top_level()[10].rank(), Some(10));
    }
}
