//! # Upstream Query Compiler
//!
//! Renders a [`Filter`] into the upstream's Lucene-style grammar:
//!
//! ```text
//! field:"value"   field:value*   field:[a TO b]   (a OR b)
//! NOT field:"value"   _exists_:field   NOT _exists_:field
//! ```
//!
//! Clause order is fixed: AND-ed field clauses in [`FilterField`] order,
//! then the free-text term, then the single parenthesised OR group.

use crate::filter::{Filter, FilterField, Predicate, Value};
use chrono::SecondsFormat;

/// Terms at least this long are matched by prefix on the name fields.
const PREFIX_TERM_LEN: usize = 5;

/// Compile a filter into the upstream query string. Deterministic for equal
/// filters.
pub fn compile(filter: &Filter) -> String {
    let mut and = Vec::new();
    for (field, predicate) in filter.predicates() {
        push_predicate(&mut and, field, predicate);
    }
    if let Some(term) = filter.term() {
        push_term(&mut and, term);
    }

    let mut or = Vec::new();
    for (field, predicate) in filter.or_group().predicates() {
        push_predicate(&mut or, field, predicate);
    }
    if !or.is_empty() {
        and.push(format!("({})", or.join(" OR ")));
    }

    and.join(" AND ")
}

/// Normalise a public sort specifier (`-last_name`, `+email`, `role`) into
/// `field:1` / `field:-1`. Specifiers already in `field:direction` form pass
/// through unchanged; only the first comma-separated column is kept.
pub fn normalize_sort(sort: &str) -> String {
    if sort.contains(':') {
        return sort.to_string();
    }
    let column = sort.split(',').next().unwrap_or_default().trim();
    let (column, direction) = if let Some(rest) = column.strip_prefix('-') {
        (rest, -1)
    } else if let Some(rest) = column.strip_prefix('+') {
        (rest, 1)
    } else {
        (column, 1)
    };
    if column.is_empty() {
        return String::new();
    }
    let upstream = match column {
        "first_name" => "given_name",
        "last_name" => "family_name",
        other => FilterField::from_name(other)
            .map(FilterField::upstream_name)
            .unwrap_or(other),
    };
    format!("{}:{}", upstream, direction)
}

fn push_predicate(out: &mut Vec<String>, field: FilterField, predicate: &Predicate) {
    let key = field.upstream_name();
    match predicate {
        Predicate::Eq(v) => out.push(literal(key, v)),
        Predicate::AnyOf(values) => {
            if !values.is_empty() {
                let parts: Vec<String> = values.iter().map(|v| literal(key, v)).collect();
                out.push(format!("({})", parts.join(" OR ")));
            }
        }
        Predicate::NotEq(v) => out.push(literal(&format!("NOT {}", key), v)),
        Predicate::NoneOf(values) => {
            if !values.is_empty() {
                let negated = format!("NOT {}", key);
                let parts: Vec<String> = values.iter().map(|v| literal(&negated, v)).collect();
                out.push(format!("({})", parts.join(" AND ")));
            }
        }
        Predicate::Exists(true) => out.push(format!("_exists_:{}", key)),
        Predicate::Exists(false) => out.push(format!("NOT _exists_:{}", key)),
        Predicate::Range(from, to) => out.push(format!(
            "{}:[{} TO {}]",
            key,
            bound(from.as_ref()),
            bound(to.as_ref())
        )),
    }
}

fn push_term(out: &mut Vec<String>, raw: &str) {
    let term: String = raw.chars().filter(|c| *c != '\\' && *c != '"').collect();
    let term = term.trim();
    if term.is_empty() {
        return;
    }

    if let Some(idx) = term.rfind(' ') {
        let given_name = term[..idx].trim_end();
        let family_name = &term[idx + 1..];
        out.push(format!("given_name:{}", quote(given_name)));
        out.push(format!("family_name:{}", quote(family_name)));
    } else if term.contains('@') {
        out.push(format!("email:{}", quote(term)));
    } else {
        let name_clause = if term.chars().count() >= PREFIX_TERM_LEN {
            format!("{}*", term)
        } else {
            quote(term)
        };
        out.push(format!(
            "(given_name:{} OR family_name:{} OR email:{}*)",
            name_clause, name_clause, term
        ));
    }
}

/// Literal values are quoted unless they carry a wildcard.
fn literal(key: &str, value: &Value) -> String {
    match value {
        Value::Str(s) if s.contains('*') => format!("{}:{}", key, s),
        Value::Str(s) => format!("{}:{}", key, quote(s)),
        Value::Bool(b) => format!("{}:{}", key, b),
        Value::Int(n) => format!("{}:{}", key, n),
        Value::Date(d) => format!("{}:{}", key, quote(&iso(d))),
    }
}

fn bound(value: Option<&Value>) -> String {
    match value {
        None => "*".to_string(),
        Some(Value::Date(d)) => iso(d),
        Some(Value::Int(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Str(s)) => s.clone(),
    }
}

fn iso(d: &chrono::DateTime<chrono::Utc>) -> String {
    d.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\\\""))
}
