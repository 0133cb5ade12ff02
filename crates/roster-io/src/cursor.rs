//! # Cursor: Enumeration Position Tracker
//!
//! Tracks which bucket an enumeration run is on and which page of that
//! bucket comes next. Refining a bucket replaces it in place with its
//! children, so the bucket list stays in lexicographic order.
//!
//! # Invariant
//!
//! Every bucket ever handed out by [`EnumerationCursor::current`] is either
//! fully paged or recorded in [`EnumerationCursor::truncated`]. A bucket is
//! never skipped silently.

use roster_core::Bucket;

pub struct EnumerationCursor {
    /// Pending and visited buckets, in processing order.
    buckets: Vec<Bucket>,

    /// Index of the bucket being paged.
    index: usize,

    /// Next page of the current bucket.
    page: u32,

    /// Buckets that still reached the result window at the depth bound.
    truncated: Vec<Bucket>,
}

impl EnumerationCursor {
    pub fn new(buckets: Vec<Bucket>) -> Self {
        Self {
            buckets,
            index: 0,
            page: 0,
            truncated: Vec::new(),
        }
    }

    /// Start at the 36 single-character buckets.
    pub fn top_level() -> Self {
        Self::new(Bucket::top_level())
    }

    /// Start with the whole search space as one bucket.
    pub fn unpartitioned() -> Self {
        Self::new(vec![Bucket::root()])
    }

    #[inline]
    pub fn current(&self) -> Option<&Bucket> {
        self.buckets.get(self.index)
    }

    #[inline]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.index >= self.buckets.len()
    }

    /// Buckets not yet finished, the current one included.
    pub fn remaining(&self) -> usize {
        self.buckets.len().saturating_sub(self.index)
    }

    pub fn truncated(&self) -> &[Bucket] {
        &self.truncated
    }

    /// Replace the current bucket with its children and restart paging on
    /// the first child. Returns `false` (and changes nothing) once the
    /// bucket is at the depth bound.
    pub fn refine(&mut self) -> bool {
        let children = match self.current() {
            Some(bucket) if bucket.can_refine() => bucket.children(),
            _ => return false,
        };
        self.buckets.splice(self.index..=self.index, children);
        self.page = 0;
        true
    }

    /// Record that the current bucket cannot be fully covered.
    pub fn mark_truncated(&mut self) {
        if let Some(bucket) = self.current().cloned() {
            if !self.truncated.contains(&bucket) {
                self.truncated.push(bucket);
            }
        }
    }

    #[inline]
    pub fn advance_page(&mut self) {
        self.page += 1;
    }

    /// Move to the next bucket, starting again at page 0.
    pub fn advance_bucket(&mut self) {
        if !self.is_exhausted() {
            self.index += 1;
        }
        self.page = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_cursor_starts_at_zero() {
        let c = EnumerationCursor::top_level();
        assert_eq!(c.current().unwrap().prefix(), "0");
        assert_eq!(c.page(), 0);
        assert_eq!(c.remaining(), 36);
        assert!(!c.is_exhausted());
    }

    #[test]
    fn test_refine_replaces_in_place() {
        let mut c = EnumerationCursor::top_level();
        for _ in 0..10 {
            c.advance_bucket();
        }
        assert_eq!(c.current().unwrap().prefix(), "a");
        c.advance_page();

        assert!(c.refine());
        assert_eq!(c.page(), 0);
        assert_eq!(c.current().unwrap().prefix(), "a_");
        assert_eq!(c.remaining(), 39 + 25);

        for _ in 0..39 {
            c.advance_bucket();
        }
        assert_eq!(c.current().unwrap().prefix(), "b");
    }

    #[test]
    fn test_refine_stops_at_depth_bound() {
        let mut c = EnumerationCursor::top_level();
        assert!(c.refine());
        assert!(!c.refine());
        assert_eq!(c.current().unwrap().prefix(), "0_");

        c.mark_truncated();
        c.mark_truncated();
        assert_eq!(c.truncated().len(), 1);
    }

    #[test]
    fn test_unpartitioned_refines_to_top_level() {
        let mut c = EnumerationCursor::unpartitioned();
        assert!(c.current().unwrap().is_root());
        assert!(c.refine());
        assert_eq!(c.remaining(), 36);
        assert_eq!(c.current().unwrap().prefix(), "0");
    }

    #[test]
    fn test_exhaustion() {
        let mut c = EnumerationCursor::new(vec![Bucket::root()]);
        c.advance_page();
        c.advance_bucket();
        assert!(c.is_exhausted());
        assert!(c.current().is_none());
        assert_eq!(c.page(), 0);
        c.advance_bucket();
        assert_eq!(c.remaining(), 0);
        assert!(!c.refine());
    }
}
