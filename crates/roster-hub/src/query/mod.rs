//! # Filter Requests
//!
//! Request and response bodies that carry a JSON filter, and the step that
//! turns one into a compiled upstream query.

use roster_core::{compile, CompileError, Filter};
use roster_io::EnumerateOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompileRequest {
    #[serde(default)]
    pub filter: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledQuery {
    pub q: String,
    pub sort: Option<String>,
}

/// Body of `POST /api/people/search`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeopleSearchRequest {
    #[serde(default)]
    pub filter: serde_json::Value,
    /// One page per bucket only.
    #[serde(default)]
    pub skip_paginate: bool,
    #[serde(default)]
    pub page_size: Option<u32>,
}

impl PeopleSearchRequest {
    pub fn options(&self, default_page_size: u32) -> EnumerateOptions {
        EnumerateOptions {
            page_size: self.page_size.unwrap_or(default_page_size),
            skip_paginate: self.skip_paginate,
            ..Default::default()
        }
    }
}

/// `null` (or an absent filter) matches everyone.
pub fn parse_filter(value: &serde_json::Value) -> Result<Filter, CompileError> {
    if value.is_null() {
        return Ok(Filter::new());
    }
    Filter::from_json(value)
}

pub fn compile_filter(value: &serde_json::Value) -> Result<CompiledQuery, CompileError> {
    let filter = parse_filter(value)?;
    Ok(CompiledQuery {
        q: compile(&filter),
        sort: filter.normalized_sort(),
    })
}
