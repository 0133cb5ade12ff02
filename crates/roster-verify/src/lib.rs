//! # roster-verify: The "Law" of ROSTER
//!
//! Kani proofs for the bucket partition the enumerator relies on.
//!
//! # Proof: Exact Cover
//!
//! Every email that starts with an alphabet character falls into exactly
//! one top-level bucket, and every email whose second character is in the
//! refinement alphabet (which adds `_`, `.` and `-`) falls into exactly one
//! child of that bucket. Refining a bucket therefore neither loses nor
//! duplicates users, and buckets are processed in alphabet order.

extern crate roster_core;

use roster_core::{Bucket, ALPHABET, REFINE_ALPHABET};

/// How many of `buckets` contain `value`.
pub fn covering(buckets: &[Bucket], value: &str) -> usize {
    buckets.iter().filter(|b| b.contains(value)).count()
}

/// Whether `buckets` are in strictly increasing alphabet order.
pub fn strictly_ordered(buckets: &[Bucket]) -> bool {
    buckets.windows(2).all(|w| match (w[0].rank(), w[1].rank()) {
        (Some(a), Some(b)) => a < b,
        _ => false,
    })
}

/// An email whose first character is `ALPHABET[first]` and whose second is
/// `REFINE_ALPHABET[second]`.
pub fn email_at(first: usize, second: usize) -> String {
    format!(
        "{}{}smith@example.com",
        ALPHABET[first % ALPHABET.len()] as char,
        REFINE_ALPHABET[second % REFINE_ALPHABET.len()] as char
    )
}

#[cfg(kani)]
mod proofs {
    use super::*;
    use roster_core::MAX_PREFIX_LEN;

    fn any_index() -> usize {
        let i: usize = kani::any();
        kani::assume(i < ALPHABET.len());
        i
    }

    fn any_refine_index() -> usize {
        let i: usize = kani::any();
        kani::assume(i < REFINE_ALPHABET.len());
        i
    }

    /// **Proof: one top-level bucket per email**
    #[kani::proof]
    #[kani::unwind(42)]
    fn verify_top_level_cover() {
        let email = email_at(any_index(), any_refine_index());
        assert_eq!(covering(&Bucket::top_level(), &email), 1);
    }

    /// **Proof: refinement is an exact cover of the parent**
    #[kani::proof]
    #[kani::unwind(42)]
    fn verify_refinement_cover() {
        let first = any_index();
        let email = email_at(first, any_refine_index());
        let parent = Bucket::top_level().swap_remove(first);

        assert!(parent.contains(&email));
        assert_eq!(covering(&parent.children(), &email), 1);
    }

    /// **Proof: children keep lexicographic order**
    #[kani::proof]
    #[kani::unwind(42)]
    fn verify_children_ordered() {
        let parent = Bucket::top_level().swap_remove(any_index());
        let children = parent.children();

        assert!(strictly_ordered(&children));
        assert!(children
            .iter()
            .all(|c| c.prefix().starts_with(parent.prefix()) && c.depth() == parent.depth() + 1));
    }

    /// **Proof: refinement stops at the depth bound**
    #[kani::proof]
    #[kani::unwind(42)]
    fn verify_depth_bound() {
        let parent = Bucket::top_level().swap_remove(any_index());
        let child = parent.children().swap_remove(any_refine_index());

        assert_eq!(child.depth(), MAX_PREFIX_LEN);
        assert!(!child.can_refine());
        assert!(child.children().is_empty());
    }
}
