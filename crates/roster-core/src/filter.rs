//! # Search Filters
//!
//! A [`Filter`] is a set of per-field predicates over a fixed whitelist of
//! upstream fields, an optional free-text term, an optional OR-group and an
//! optional sort specifier.
//!
//! Predicates are kept in a `BTreeMap` keyed by [`FilterField`], whose
//! declaration order is the compile order, so two equal filters always
//! compile to the same string regardless of how they were built.
//!
//! JSON form accepted by [`Filter::from_json`]:
//! ```text
//! { "role": ["teacher", "editor"], "blocked": false, "gender": null,
//!   "logins_count": [1, null], "email_verified": { "ne": false },
//!   "term": "jane", "sort": "-last_name", "or": { "role": "admin" } }
//! ```

use crate::error::CompileError;
use crate::user::{Gender, Role};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use std::collections::BTreeMap;

/// Whitelisted filter fields, in compile order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FilterField {
    UserId,
    Blocked,
    IdentityProvider,
    Role,
    Email,
    Gender,
    LastLogin,
    LoginsCount,
    EmailVerified,
}

/// The value domain of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Bool,
    Integer,
    Date,
}

impl FilterField {
    pub const ALL: [FilterField; 9] = [
        FilterField::UserId,
        FilterField::Blocked,
        FilterField::IdentityProvider,
        FilterField::Role,
        FilterField::Email,
        FilterField::Gender,
        FilterField::LastLogin,
        FilterField::LoginsCount,
        FilterField::EmailVerified,
    ];

    /// Name callers use.
    pub fn public_name(self) -> &'static str {
        match self {
            Self::UserId => "user_id",
            Self::Blocked => "blocked",
            Self::IdentityProvider => "identity_provider",
            Self::Role => "role",
            Self::Email => "email",
            Self::Gender => "gender",
            Self::LastLogin => "last_login",
            Self::LoginsCount => "logins_count",
            Self::EmailVerified => "email_verified",
        }
    }

    /// Name the upstream indexes the field under.
    pub fn upstream_name(self) -> &'static str {
        match self {
            Self::IdentityProvider => "identities.provider",
            Self::Role => "app_metadata.role",
            Self::Gender => "user_metadata.gender",
            other => other.public_name(),
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Self::Blocked | Self::EmailVerified => FieldKind::Bool,
            Self::LoginsCount => FieldKind::Integer,
            Self::LastLogin => FieldKind::Date,
            _ => FieldKind::Text,
        }
    }

    /// Resolve either the public alias or the upstream name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|f| f.public_name() == name || f.upstream_name() == name)
    }
}

/// A literal compared against a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Date(DateTime<Utc>),
}

impl Value {
    fn kind(&self) -> FieldKind {
        match self {
            Self::Str(_) => FieldKind::Text,
            Self::Bool(_) => FieldKind::Bool,
            Self::Int(_) => FieldKind::Integer,
            Self::Date(_) => FieldKind::Date,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

impl From<Role> for Value {
    fn from(r: Role) -> Self {
        Self::Str(r.as_str().to_string())
    }
}

impl From<Gender> for Value {
    fn from(g: Gender) -> Self {
        Self::Str(g.as_str().to_string())
    }
}

/// A constraint on one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    /// Any of the values (OR-set). An empty set emits nothing.
    AnyOf(Vec<Value>),
    NotEq(Value),
    /// None of the values (AND of negations). An empty set emits nothing.
    NoneOf(Vec<Value>),
    /// `Exists(false)` is what a JSON `null` means.
    Exists(bool),
    /// Inclusive range; `None` is an open end.
    Range(Option<Value>, Option<Value>),
}

impl Predicate {
    fn name(&self) -> &'static str {
        match self {
            Self::Eq(_) => "eq",
            Self::AnyOf(_) => "any_of",
            Self::NotEq(_) => "ne",
            Self::NoneOf(_) => "none_of",
            Self::Exists(_) => "exists",
            Self::Range(..) => "range",
        }
    }

    fn validate(&self, field: FilterField) -> Result<(), CompileError> {
        let name = field.public_name();
        match self {
            Self::Eq(v) | Self::NotEq(v) => check_value(field, v),
            Self::AnyOf(vs) | Self::NoneOf(vs) => vs.iter().try_for_each(|v| check_value(field, v)),
            Self::Exists(_) => Ok(()),
            Self::Range(from, to) => {
                if !matches!(field.kind(), FieldKind::Integer | FieldKind::Date) {
                    return Err(CompileError::UnsupportedPredicate {
                        field: name.to_string(),
                        predicate: self.name().to_string(),
                    });
                }
                for bound in [from, to].into_iter().flatten() {
                    if bound.kind() != field.kind() {
                        return Err(CompileError::range(name, "bound type does not match field"));
                    }
                }
                match (from, to) {
                    (None, None) => Err(CompileError::range(name, "both ends are open")),
                    (Some(Value::Int(a)), Some(Value::Int(b))) if a > b => {
                        Err(CompileError::range(name, format!("{} is after {}", a, b)))
                    }
                    (Some(Value::Date(a)), Some(Value::Date(b))) if a > b => {
                        Err(CompileError::range(name, "start is after end"))
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

fn check_value(field: FilterField, value: &Value) -> Result<(), CompileError> {
    let name = field.public_name();
    if value.kind() != field.kind() {
        return Err(CompileError::invalid(
            name,
            format!("expected {:?}, got {:?}", field.kind(), value.kind()),
        ));
    }
    if let Value::Str(s) = value {
        match field {
            FilterField::Role => {
                s.parse::<Role>().map_err(|e| CompileError::invalid(name, e))?;
            }
            FilterField::Gender => {
                s.parse::<Gender>().map_err(|e| CompileError::invalid(name, e))?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Predicates combined with OR, then AND-ed against the rest of the filter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrGroup {
    predicates: BTreeMap<FilterField, Predicate>,
}

impl OrGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: FilterField, predicate: Predicate) -> Result<Self, CompileError> {
        predicate.validate(field)?;
        self.predicates.insert(field, predicate);
        Ok(self)
    }

    pub fn predicates(&self) -> impl Iterator<Item = (FilterField, &Predicate)> {
        self.predicates.iter().map(|(f, p)| (*f, p))
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    fn from_json(value: &Json) -> Result<Self, CompileError> {
        let object = value
            .as_object()
            .ok_or_else(|| CompileError::invalid("or", "expected an object"))?;
        let mut group = Self::new();
        for (key, raw) in object {
            let field =
                FilterField::from_name(key).ok_or_else(|| CompileError::UnknownField(key.clone()))?;
            group = group.with(field, parse_predicate(field, raw)?)?;
        }
        Ok(group)
    }
}

/// An immutable-by-convention search filter. Builder methods consume and
/// return `self`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: BTreeMap<FilterField, Predicate>,
    term: Option<String>,
    or: OrGroup,
    sort: Option<String>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: FilterField, predicate: Predicate) -> Result<Self, CompileError> {
        predicate.validate(field)?;
        self.predicates.insert(field, predicate);
        Ok(self)
    }

    pub fn without(mut self, field: FilterField) -> Self {
        self.predicates.remove(&field);
        self
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    pub fn with_sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn with_or(mut self, group: OrGroup) -> Self {
        self.or = group;
        self
    }

    pub fn get(&self, field: FilterField) -> Option<&Predicate> {
        self.predicates.get(&field)
    }

    pub fn predicates(&self) -> impl Iterator<Item = (FilterField, &Predicate)> {
        self.predicates.iter().map(|(f, p)| (*f, p))
    }

    pub fn term(&self) -> Option<&str> {
        self.term.as_deref()
    }

    pub fn or_group(&self) -> &OrGroup {
        &self.or
    }

    pub fn sort(&self) -> Option<&str> {
        self.sort.as_deref()
    }

    /// The sort specifier in upstream `field:direction` form.
    pub fn normalized_sort(&self) -> Option<String> {
        self.sort
            .as_deref()
            .map(crate::query::normalize_sort)
            .filter(|s| !s.is_empty())
    }

    /// Build a filter from its JSON form, rejecting unknown fields and
    /// malformed values before anything is sent upstream.
    pub fn from_json(value: &Json) -> Result<Self, CompileError> {
        let object = value
            .as_object()
            .ok_or_else(|| CompileError::invalid("filter", "expected an object"))?;
        let mut filter = Self::new();
        for (key, raw) in object {
            match key.as_str() {
                "term" => match raw {
                    Json::String(s) => filter.term = Some(s.clone()),
                    Json::Null => {}
                    _ => return Err(CompileError::invalid("term", "expected a string")),
                },
                "sort" => match raw {
                    Json::String(s) => filter.sort = Some(s.clone()),
                    Json::Null => {}
                    _ => return Err(CompileError::invalid("sort", "expected a string")),
                },
                "or" => {
                    if !raw.is_null() {
                        filter.or = OrGroup::from_json(raw)?;
                    }
                }
                _ => {
                    let field = FilterField::from_name(key)
                        .ok_or_else(|| CompileError::UnknownField(key.clone()))?;
                    filter = filter.with(field, parse_predicate(field, raw)?)?;
                }
            }
        }
        Ok(filter)
    }
}

fn parse_predicate(field: FilterField, raw: &Json) -> Result<Predicate, CompileError> {
    let name = field.public_name();
    let ranged = matches!(field.kind(), FieldKind::Integer | FieldKind::Date);
    match raw {
        Json::Null => Ok(Predicate::Exists(false)),
        Json::Array(items) if ranged => match items.as_slice() {
            [from, to] => Ok(Predicate::Range(
                parse_bound(field, from)?,
                parse_bound(field, to)?,
            )),
            _ => Err(CompileError::range(name, "expected [from, to]")),
        },
        Json::Array(items) => Ok(Predicate::AnyOf(
            items
                .iter()
                .map(|v| parse_value(field, v))
                .collect::<Result<_, _>>()?,
        )),
        Json::Object(map) => {
            let (op, operand) = match map.iter().next() {
                Some(entry) if map.len() == 1 => entry,
                _ => return Err(CompileError::invalid(name, "expected a single operator")),
            };
            match (op.as_str(), operand) {
                ("ne", Json::Array(items)) => Ok(Predicate::NoneOf(
                    items
                        .iter()
                        .map(|v| parse_value(field, v))
                        .collect::<Result<_, _>>()?,
                )),
                ("ne", v) => Ok(Predicate::NotEq(parse_value(field, v)?)),
                ("exists", Json::Bool(b)) => Ok(Predicate::Exists(*b)),
                (other, _) => Err(CompileError::UnsupportedPredicate {
                    field: name.to_string(),
                    predicate: other.to_string(),
                }),
            }
        }
        scalar => Ok(Predicate::Eq(parse_value(field, scalar)?)),
    }
}

fn parse_bound(field: FilterField, raw: &Json) -> Result<Option<Value>, CompileError> {
    if raw.is_null() {
        return Ok(None);
    }
    parse_value(field, raw).map(Some)
}

fn parse_value(field: FilterField, raw: &Json) -> Result<Value, CompileError> {
    let name = field.public_name();
    match (field.kind(), raw) {
        (FieldKind::Text, Json::String(s)) => Ok(Value::Str(s.clone())),
        (FieldKind::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldKind::Integer, Json::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .ok_or_else(|| CompileError::invalid(name, "expected an integer")),
        (FieldKind::Date, Json::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|d| Value::Date(d.with_timezone(&Utc)))
            .map_err(|e| CompileError::invalid(name, e.to_string())),
        (kind, other) => Err(CompileError::invalid(
            name,
            format!("expected {:?}, got {}", kind, other),
        )),
    }
}
