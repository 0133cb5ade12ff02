//! In-memory [`Directory`] for tests.
//!
//! Understands enough of the query grammar to drive the enumerator: `AND` /
//! `OR` / parentheses, `NOT`, `_exists_:`, quoted values and trailing
//! wildcards on `user_id`, `email`, the name fields, `app_metadata.role`,
//! `identities.provider`, `user_metadata.gender` and the boolean fields.
//! Clauses on anything else (ranges included) match every user. Paging
//! stops at the result window the way the real upstream does.

use crate::directory::{Directory, RoleInfo, SearchRequest};
use crate::error::DirectoryError;
use roster_core::{Role, User, UserPage, UserUpdate, RESULT_WINDOW};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct State {
    users: BTreeMap<String, User>,
    searches: Vec<SearchRequest>,
    fail_matching: Vec<String>,
    latency: Option<Duration>,
    /// user id -> role ids
    assignments: BTreeMap<String, BTreeSet<String>>,
    permissions: BTreeMap<String, Vec<String>>,
    next_id: usize,
}

#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<State>,
    calls: AtomicUsize,
}

fn role_id(role: Role) -> String {
    format!("rol_{}", role.as_str())
}

impl FakeDirectory {
    pub fn with_users(users: Vec<User>) -> Self {
        let fake = Self::default();
        for user in users {
            fake.insert(user);
        }
        fake
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, user: User) {
        self.state().users.insert(user.user_id.clone(), user);
    }

    /// Upstream calls made so far, of every kind.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Search requests received, in order. Failed ones included.
    pub fn searches(&self) -> Vec<SearchRequest> {
        self.state().searches.clone()
    }

    /// Fail every search whose query contains `needle` with an HTTP 500.
    pub fn fail_searches_matching(&self, needle: &str) {
        self.state().fail_matching.push(needle.to_string());
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    pub fn set_permissions(&self, id: &str, permissions: Vec<String>) {
        self.state()
            .permissions
            .insert(id.to_string(), permissions);
    }

    /// Names of the roles assigned to `id`, sorted.
    pub fn role_names(&self, id: &str) -> Vec<String> {
        self.state()
            .assignments
            .get(id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|r| r.strip_prefix("rol_").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn apply(user: &mut User, data: &UserUpdate) {
    if let Some(email) = &data.email {
        user.email = email.clone();
    }
    if let Some(given_name) = &data.given_name {
        user.given_name = Some(given_name.clone());
    }
    if let Some(family_name) = &data.family_name {
        user.family_name = Some(family_name.clone());
    }
    if let Some(blocked) = data.blocked {
        user.blocked = blocked;
    }
    if let Some(email_verified) = data.email_verified {
        user.email_verified = email_verified;
    }
    if let Some(app_metadata) = &data.app_metadata {
        user.app_metadata = app_metadata.clone();
    }
    if let Some(user_metadata) = &data.user_metadata {
        user.user_metadata = user_metadata.clone();
    }
}

#[async_trait::async_trait]
impl Directory for FakeDirectory {
    async fn search(&self, request: &SearchRequest) -> Result<UserPage, DirectoryError> {
        self.enter().await;
        let mut matched = {
            let mut state = self.state();
            state.searches.push(request.clone());
            if state.fail_matching.iter().any(|n| request.q.contains(n)) {
                return Err(DirectoryError::Http {
                    status: 500,
                    message: "injected failure".into(),
                });
            }
            state
                .users
                .values()
                .filter(|u| matches(&request.q, u))
                .cloned()
                .collect::<Vec<_>>()
        };
        matched.sort_by(|a, b| (&a.email, &a.user_id).cmp(&(&b.email, &b.user_id)));

        let per_page = u64::from(request.per_page.max(1));
        let start = u64::from(request.page) * per_page;
        if start >= RESULT_WINDOW {
            return Err(DirectoryError::Http {
                status: 400,
                message: format!("you can only page through the first {RESULT_WINDOW} records"),
            });
        }
        let total = matched.len() as u64;
        let end = (start + per_page).min(total).min(RESULT_WINDOW);
        let users = if start < end {
            matched[start as usize..end as usize].to_vec()
        } else {
            Vec::new()
        };
        Ok(UserPage {
            users,
            total,
            start,
            limit: per_page,
        })
    }

    async fn get_user(&self, id: &str) -> Result<User, DirectoryError> {
        self.enter().await;
        self.state()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn create_user(&self, data: &UserUpdate) -> Result<User, DirectoryError> {
        self.enter().await;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("auth0|new{}", state.next_id);
        let mut user = User::new(id.clone(), "");
        apply(&mut user, data);
        state.users.insert(id, user.clone());
        Ok(user)
    }

    async fn update_user(&self, id: &str, data: &UserUpdate) -> Result<User, DirectoryError> {
        self.enter().await;
        let mut state = self.state();
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))?;
        apply(user, data);
        Ok(user.clone())
    }

    async fn delete_user(&self, id: &str) -> Result<(), DirectoryError> {
        self.enter().await;
        let mut state = self.state();
        state.assignments.remove(id);
        state
            .users
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    async fn users_by_email(&self, email: &str) -> Result<Vec<User>, DirectoryError> {
        self.enter().await;
        Ok(self
            .state()
            .users
            .values()
            .filter(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .collect())
    }

    async fn user_permissions(&self, id: &str) -> Result<Vec<String>, DirectoryError> {
        self.enter().await;
        Ok(self.state().permissions.get(id).cloned().unwrap_or_default())
    }

    async fn roles(&self) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.enter().await;
        Ok(Role::ALL
            .iter()
            .map(|&r| RoleInfo {
                id: role_id(r),
                name: r.as_str().to_string(),
            })
            .collect())
    }

    async fn user_roles(&self, id: &str) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.enter().await;
        Ok(self
            .state()
            .assignments
            .get(id)
            .into_iter()
            .flatten()
            .map(|rid| RoleInfo {
                id: rid.clone(),
                name: rid.trim_start_matches("rol_").to_string(),
            })
            .collect())
    }

    async fn assign_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.enter().await;
        self.state()
            .assignments
            .entry(id.to_string())
            .or_default()
            .extend(role_ids.iter().cloned());
        Ok(())
    }

    async fn remove_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.enter().await;
        if let Some(assigned) = self.state().assignments.get_mut(id) {
            for rid in role_ids {
                assigned.remove(rid);
            }
        }
        Ok(())
    }
}

/// Split `expr` on `sep` where it is outside quotes and parentheses.
fn split_top(expr: &str, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quoted = false;
    let mut escaped = false;
    let mut last = 0;
    let bytes = expr.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if escaped {
            escaped = false;
        } else if c == b'\\' {
            escaped = true;
        } else if c == b'"' {
            quoted = !quoted;
        } else if !quoted && c == b'(' {
            depth += 1;
        } else if !quoted && c == b')' {
            depth -= 1;
        } else if !quoted && depth == 0 && expr[i..].starts_with(sep) {
            parts.push(expr[last..i].to_string());
            i += sep.len();
            last = i;
            continue;
        }
        i += 1;
    }
    parts.push(expr[last..].to_string());
    parts
}

/// Whether the whole of `expr` is one parenthesised group.
fn strip_group(expr: &str) -> Option<&str> {
    let inner = expr.strip_prefix('(')?.strip_suffix(')')?;
    let mut depth = 0i32;
    let mut quoted = false;
    for c in inner.chars() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            _ => {}
        }
    }
    Some(inner)
}

fn matches(expr: &str, user: &User) -> bool {
    let expr = expr.trim();
    if expr.is_empty() {
        return true;
    }
    let and = split_top(expr, " AND ");
    if and.len() > 1 {
        return and.iter().all(|e| matches(e, user));
    }
    let or = split_top(expr, " OR ");
    if or.len() > 1 {
        return or.iter().any(|e| matches(e, user));
    }
    if let Some(inner) = strip_group(expr) {
        return matches(inner, user);
    }
    if let Some(rest) = expr.strip_prefix("NOT ") {
        return !matches(rest, user);
    }
    if let Some(field) = expr.strip_prefix("_exists_:") {
        return field_values(field, user).is_some_and(|v| !v.is_empty());
    }
    let Some((key, raw)) = expr.split_once(':') else {
        return true;
    };
    let Some(values) = field_values(key, user) else {
        return true;
    };
    if raw.starts_with('[') {
        return true;
    }
    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        let wanted = quoted.replace("\\\"", "\"");
        return values.iter().any(|v| *v == wanted);
    }
    if let Some(prefix) = raw.strip_suffix('*') {
        let prefix = prefix.to_ascii_lowercase();
        return values
            .iter()
            .any(|v| v.to_ascii_lowercase().starts_with(&prefix));
    }
    values.iter().any(|v| v.eq_ignore_ascii_case(raw))
}

/// Values of an upstream field for `user`; `None` for fields the fake does
/// not model.
fn field_values(key: &str, user: &User) -> Option<Vec<String>> {
    let values = match key {
        "user_id" => vec![user.user_id.clone()],
        "email" => vec![user.email.clone()],
        "given_name" => user.given_name.iter().cloned().collect(),
        "family_name" => user.family_name.iter().cloned().collect(),
        "app_metadata.role" => user.role().map(|r| r.to_string()).into_iter().collect(),
        "identities.provider" => user.identities.iter().map(|i| i.provider.clone()).collect(),
        "user_metadata.gender" => user
            .user_metadata
            .gender
            .map(|g| g.to_string())
            .into_iter()
            .collect(),
        "blocked" => vec![user.blocked.to_string()],
        "email_verified" => vec![user.email_verified.to_string()],
        _ => return None,
    };
    Some(values)
}
