//! # Exhaustive Enumerator
//!
//! The upstream never pages past its first [`RESULT_WINDOW`] matches. To
//! reach every user matching a filter, the run shards the search space into
//! email-prefix [`Bucket`]s small enough to page through completely:
//!
//! 1. Start at the 36 single-character buckets (or one unpartitioned root
//!    bucket, see [`StartDepth`]).
//! 2. Fetch page 0 of the current bucket.
//! 3. A page-0 total at or above the window refines the bucket into its
//!    children and the first child is fetched next. At the depth bound the
//!    bucket is paged as far as the window allows and reported truncated.
//! 4. Page forward while pages come back full, then move to the next bucket.
//!
//! A run is forward-only and single-reader. Every page fetch awaits the
//! shared [`Throttle`](crate::throttle::Throttle) through the injected
//! directory, so many runs can coexist under one budget.

use crate::cache::ResponseCache;
use crate::cursor::EnumerationCursor;
use crate::directory::{Directory, SearchRequest};
use crate::error::EnumerateError;
use crate::users::user_key;
use futures::stream::{self, Stream};
use roster_core::{
    compile, Bucket, CompileError, Filter, FilterField, Predicate, User, MAX_PAGE_SIZE,
    RESULT_WINDOW,
};
use std::sync::Arc;
use std::time::Duration;

/// Where a run starts partitioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartDepth {
    /// The 36 single-character buckets.
    #[default]
    TopLevel,
    /// One bucket covering everything, refined only if it reaches the
    /// window. Suits filters known to match few users (an id batch).
    Root,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumerateOptions {
    /// Users per upstream page, clamped to `1..=MAX_PAGE_SIZE`.
    pub page_size: u32,
    /// Fetch only page 0 of each bucket.
    pub skip_paginate: bool,
    pub start: StartDepth,
}

impl Default for EnumerateOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            skip_paginate: false,
            start: StartDepth::TopLevel,
        }
    }
}

/// One yielded page.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumeratedPage {
    pub users: Vec<User>,
    /// Matches in `bucket`, as reported with this page.
    pub total: u64,
    pub start: u64,
    pub bucket: Bucket,
    pub page: u32,
    /// `bucket` reached the window at the depth bound; some of its users
    /// are unreachable.
    pub truncated: bool,
}

/// Everything a run produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Enumeration {
    pub users: Vec<User>,
    /// Sum of the page-0 totals of every bucket visited.
    pub count: u64,
    pub truncated: Vec<Bucket>,
}

impl Enumeration {
    pub fn is_complete(&self) -> bool {
        self.truncated.is_empty()
    }
}

pub struct Enumerator {
    directory: Arc<dyn Directory>,
    filter: Filter,
    sort: Option<String>,
    page_size: u32,
    skip_paginate: bool,
    cursor: EnumerationCursor,
    cache: Option<(ResponseCache, Duration)>,
    finished: bool,
}

impl Enumerator {
    /// Fails when the filter constrains `email`, which the run owns.
    pub fn new(
        directory: Arc<dyn Directory>,
        filter: Filter,
        options: EnumerateOptions,
    ) -> Result<Self, CompileError> {
        if filter.get(FilterField::Email).is_some() {
            return Err(CompileError::EngineManagedField(
                FilterField::Email.public_name().to_string(),
            ));
        }
        let cursor = match options.start {
            StartDepth::TopLevel => EnumerationCursor::top_level(),
            StartDepth::Root => EnumerationCursor::unpartitioned(),
        };
        Ok(Self {
            directory,
            sort: filter.normalized_sort(),
            filter,
            page_size: options.page_size.clamp(1, MAX_PAGE_SIZE),
            skip_paginate: options.skip_paginate,
            cursor,
            cache: None,
            finished: false,
        })
    }

    /// Write every fetched user to `user:{id}` for `ttl`.
    pub fn with_cache(mut self, cache: ResponseCache, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Buckets found truncated so far.
    pub fn truncated_buckets(&self) -> &[Bucket] {
        self.cursor.truncated()
    }

    fn query_for(&self, bucket: &Bucket) -> Result<String, CompileError> {
        Ok(match bucket.pattern() {
            None => compile(&self.filter),
            Some(pattern) => compile(
                &self
                    .filter
                    .clone()
                    .with(FilterField::Email, Predicate::Eq(pattern.into()))?,
            ),
        })
    }

    /// The next page, or `None` once every bucket is done. After an error
    /// the run is finished.
    pub async fn next_page(&mut self) -> Option<Result<EnumeratedPage, EnumerateError>> {
        if self.finished {
            return None;
        }
        match self.step().await {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    async fn step(&mut self) -> Result<Option<EnumeratedPage>, EnumerateError> {
        loop {
            let Some(bucket) = self.cursor.current().cloned() else {
                return Ok(None);
            };
            let page = self.cursor.page();
            let request = SearchRequest {
                q: self.query_for(&bucket)?,
                sort: self.sort.clone(),
                page,
                per_page: self.page_size,
                include_totals: true,
            };
            let result = self.directory.search(&request).await?;

            if page == 0 && result.total >= RESULT_WINDOW {
                if self.cursor.refine() {
                    tracing::debug!(bucket = %bucket, total = result.total, "refining bucket");
                    continue;
                }
                tracing::warn!(
                    bucket = %bucket,
                    total = result.total,
                    window = RESULT_WINDOW,
                    "bucket exceeds the result window at the depth bound; results truncated"
                );
                self.cursor.mark_truncated();
            }

            let fetched = result.users.len() as u64;
            let start = u64::from(page) * u64::from(self.page_size);
            let next_start = start + u64::from(self.page_size);
            if let (Some(first), Some(last)) = (result.users.first(), result.users.last()) {
                tracing::debug!(
                    "{}~{} [{},{}]/{}",
                    first.email,
                    last.email,
                    start,
                    start + fetched,
                    result.total
                );
            }

            let more = !self.skip_paginate
                && fetched == u64::from(self.page_size)
                && next_start < result.total.min(RESULT_WINDOW);
            if more {
                self.cursor.advance_page();
            } else {
                self.cursor.advance_bucket();
            }

            self.cache_users(&result.users).await;

            return Ok(Some(EnumeratedPage {
                truncated: self.cursor.truncated().contains(&bucket),
                users: result.users,
                total: result.total,
                start,
                bucket,
                page,
            }));
        }
    }

    async fn cache_users(&self, users: &[User]) {
        let Some((cache, ttl)) = &self.cache else {
            return;
        };
        let mut entries = Vec::with_capacity(users.len());
        for user in users {
            match serde_json::to_string(user) {
                Ok(raw) => entries.push((user_key(&user.user_id), raw)),
                Err(e) => tracing::warn!(user_id = %user.user_id, error = %e, "user not cached"),
            }
        }
        if let Err(e) = cache.store().set_many(entries, *ttl).await {
            tracing::warn!(error = %e, "failed to cache enumerated users");
        }
    }

    /// Adapt the run into a [`Stream`] of pages.
    pub fn into_stream(self) -> impl Stream<Item = Result<EnumeratedPage, EnumerateError>> {
        stream::unfold(self, |mut run| async move {
            run.next_page().await.map(|page| (page, run))
        })
    }

    /// Drain the run.
    pub async fn collect(mut self) -> Result<Enumeration, EnumerateError> {
        let mut out = Enumeration::default();
        while let Some(page) = self.next_page().await {
            let page = page?;
            if page.page == 0 {
                out.count += page.total;
            }
            out.users.extend(page.users);
        }
        out.truncated = self.cursor.truncated().to_vec();
        Ok(out)
    }
}
