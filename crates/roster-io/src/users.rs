//! # Users Service
//!
//! Upstream user operations behind a write-through cache. Reads prefer
//! `user:{id}`; every mutation re-caches (or drops) the affected user.
//! Concurrent fetches of the same user share one upstream call.

use crate::cache::ResponseCache;
use crate::directory::{Directory, RoleInfo, SearchRequest};
use crate::enumerate::{EnumerateOptions, Enumerator, StartDepth};
use crate::error::{DirectoryError, EnumerateError};
use futures::future::join_all;
use roster_core::{
    compile, AppMetadata, CompileError, Filter, FilterField, Predicate, Role, User, UserMetadata,
    UserPage, UserUpdate, MAX_PAGE_SIZE,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Cache key of one user.
pub fn user_key(id: &str) -> String {
    format!("user:{}", id)
}

fn roles_key(namespace: &str) -> String {
    format!("roles:{}", namespace)
}

/// Identities of this provider are managed by us and accept name changes.
const DATABASE_PROVIDER: &str = "auth0";

const DEFAULT_SEARCH_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsersConfig {
    /// Distinguishes tenants sharing a store (the upstream domain).
    pub namespace: String,
    pub user_ttl: Duration,
    pub default_ttl: Duration,
    /// Ids per batch-fetch sub-batch.
    pub batch_size: usize,
    /// Page size for enumeration runs.
    pub page_size: u32,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            namespace: "default".into(),
            user_ttl: Duration::from_secs(86_400),
            default_ttl: Duration::from_secs(3_600),
            batch_size: 64,
            page_size: MAX_PAGE_SIZE,
        }
    }
}

/// How [`Users::get_user`] treats a cached copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Prefer,
    /// Always fetch, then re-cache.
    Refresh,
}

/// One page of a plain (non-exhaustive) search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    pub filter: Filter,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

#[derive(Clone)]
pub struct Users {
    directory: Arc<dyn Directory>,
    cache: ResponseCache,
    config: UsersConfig,
}

impl Users {
    pub fn new(directory: Arc<dyn Directory>, cache: ResponseCache, config: UsersConfig) -> Self {
        Self {
            directory,
            cache,
            config,
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn config(&self) -> &UsersConfig {
        &self.config
    }

    /// One upstream page. Every returned user is cached.
    pub async fn search(&self, options: &SearchOptions) -> Result<UserPage, EnumerateError> {
        let request = SearchRequest {
            q: compile(&options.filter),
            sort: options.filter.normalized_sort(),
            page: options.page.unwrap_or(0),
            per_page: options
                .per_page
                .unwrap_or(DEFAULT_SEARCH_PAGE_SIZE)
                .clamp(1, MAX_PAGE_SIZE),
            include_totals: true,
        };
        let page = self.directory.search(&request).await?;
        self.remember_all(&page.users).await;
        Ok(page)
    }

    /// An exhaustive run over `filter` that caches what it fetches.
    pub fn enumerate(
        &self,
        filter: Filter,
        options: EnumerateOptions,
    ) -> Result<Enumerator, CompileError> {
        Ok(Enumerator::new(self.directory.clone(), filter, options)?
            .with_cache(self.cache.clone(), self.config.user_ttl))
    }

    pub async fn get_user(&self, id: &str, mode: CacheMode) -> Result<User, DirectoryError> {
        let key = user_key(id);
        if mode == CacheMode::Prefer {
            let hit: Vec<Option<User>> = self.cache.get_many(std::slice::from_ref(&key)).await?;
            if let Some(Some(user)) = hit.into_iter().next() {
                return Ok(user);
            }
        }

        let directory = self.directory.clone();
        let cache = self.cache.clone();
        let ttl = self.config.user_ttl;
        let owned_id = id.to_string();
        self.cache
            .deduplicated(&key, move || async move {
                let user = directory.get_user(&owned_id).await?;
                cache.put(&user_key(&user.user_id), &user, ttl).await?;
                Ok(user)
            })
            .await
    }

    /// Users for `ids`, in the order given. Cache misses are searched in
    /// sub-batches; a failing sub-batch is logged and its slots stay `None`.
    pub async fn get_users(&self, ids: &[String]) -> Result<Vec<Option<User>>, DirectoryError> {
        let keys: Vec<String> = ids.iter().map(|id| user_key(id)).collect();
        let mut found: Vec<Option<User>> = self.cache.get_many(&keys).await?;

        let mut missing: Vec<String> = Vec::new();
        for (id, slot) in ids.iter().zip(&found) {
            if slot.is_none() && !missing.contains(id) {
                missing.push(id.clone());
            }
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let batches = missing
            .chunks(self.config.batch_size.max(1))
            .map(|chunk| self.fetch_batch(chunk));
        let mut fetched: HashMap<String, User> = HashMap::new();
        for result in join_all(batches).await {
            for user in result {
                fetched.insert(user.user_id.clone(), user);
            }
        }

        for (id, slot) in ids.iter().zip(found.iter_mut()) {
            if slot.is_none() {
                *slot = fetched.get(id).cloned();
            }
        }
        Ok(found)
    }

    async fn fetch_batch(&self, ids: &[String]) -> Vec<User> {
        let filter = Filter::new().with(
            FilterField::UserId,
            Predicate::AnyOf(ids.iter().map(|id| id.as_str().into()).collect()),
        );
        let run = filter.and_then(|filter| {
            self.enumerate(
                filter,
                EnumerateOptions {
                    page_size: self.config.page_size,
                    skip_paginate: false,
                    start: StartDepth::Root,
                },
            )
        });
        let result = match run {
            Ok(run) => run.collect().await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(enumeration) => enumeration.users,
            Err(e) => {
                tracing::warn!(batch = ids.len(), error = %e, "user batch fetch failed");
                Vec::new()
            }
        }
    }

    pub async fn create_user(&self, data: &UserUpdate) -> Result<User, DirectoryError> {
        let user = self.directory.create_user(data).await?;
        tracing::info!(user_id = %user.user_id, "user created");
        self.remember(&user).await;
        Ok(user)
    }

    /// Name changes are dropped for identities we do not manage.
    pub async fn update_user(&self, id: &str, data: &UserUpdate) -> Result<User, DirectoryError> {
        let mut data = data.clone();
        if !id.starts_with(DATABASE_PROVIDER) {
            data.given_name = None;
            data.family_name = None;
        }
        let user = self.directory.update_user(id, &data).await?;
        tracing::info!(user_id = %id, "user updated");
        self.remember(&user).await;
        Ok(user)
    }

    pub async fn update_app_metadata(
        &self,
        id: &str,
        app_metadata: AppMetadata,
    ) -> Result<User, DirectoryError> {
        let data = UserUpdate {
            app_metadata: Some(app_metadata),
            ..Default::default()
        };
        self.update_user(id, &data).await
    }

    pub async fn update_user_metadata(
        &self,
        id: &str,
        user_metadata: UserMetadata,
    ) -> Result<User, DirectoryError> {
        let data = UserUpdate {
            user_metadata: Some(user_metadata),
            ..Default::default()
        };
        self.update_user(id, &data).await
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), DirectoryError> {
        self.directory.delete_user(id).await?;
        tracing::info!(user_id = %id, "user deleted");
        self.cache.invalidate(&user_key(id)).await?;
        Ok(())
    }

    pub async fn users_by_email(&self, email: &str) -> Result<Vec<User>, DirectoryError> {
        self.directory.users_by_email(email).await
    }

    /// Delete every user registered with `email`. Returns how many went.
    pub async fn remove_users_by_email(&self, email: &str) -> Result<usize, DirectoryError> {
        let users = self.users_by_email(email).await?;
        for user in &users {
            self.delete_user(&user.user_id).await?;
        }
        Ok(users.len())
    }

    /// Every role defined upstream, cached for the default TTL.
    pub async fn roles(&self) -> Result<Vec<RoleInfo>, DirectoryError> {
        let directory = self.directory.clone();
        self.cache
            .deduplicated_cached(
                &roles_key(&self.config.namespace),
                self.config.default_ttl,
                move || async move { directory.roles().await },
            )
            .await
    }

    /// Upstream ids of the roles named `role`.
    pub async fn role_ids(&self, role: Role) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .roles()
            .await?
            .into_iter()
            .filter(|r| r.name.eq_ignore_ascii_case(role.as_str()))
            .map(|r| r.id)
            .collect())
    }

    /// Make `role` the user's only role, upstream and in `app_metadata`.
    /// Calls are skipped where nothing would change.
    pub async fn set_role(&self, user: &User, role: Role) -> Result<User, DirectoryError> {
        let id = &user.user_id;
        let wanted: BTreeSet<String> = self.role_ids(role).await?.into_iter().collect();
        let current: BTreeSet<String> = self
            .directory
            .user_roles(id)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        if wanted != current {
            let stale: Vec<String> = current.difference(&wanted).cloned().collect();
            let missing: Vec<String> = wanted.difference(&current).cloned().collect();
            if !stale.is_empty() {
                self.directory.remove_roles(id, &stale).await?;
            }
            if !missing.is_empty() {
                self.directory.assign_roles(id, &missing).await?;
            }
            tracing::info!(user_id = %id, role = %role, "user roles replaced");
        }

        if user.role() == Some(role) {
            return Ok(user.clone());
        }
        let mut app_metadata = user.app_metadata.clone();
        app_metadata.role = Some(role);
        self.update_app_metadata(id, app_metadata).await
    }

    pub async fn user_permissions(&self, id: &str) -> Result<Vec<String>, DirectoryError> {
        self.directory.user_permissions(id).await
    }

    pub async fn invalidate(&self, id: &str) -> Result<bool, DirectoryError> {
        Ok(self.cache.invalidate(&user_key(id)).await?)
    }

    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, DirectoryError> {
        let removed = self.cache.invalidate_prefix(prefix).await?;
        tracing::info!(prefix, removed, "cache entries invalidated");
        Ok(removed)
    }

    async fn remember(&self, user: &User) {
        if let Err(e) = self
            .cache
            .put(&user_key(&user.user_id), user, self.config.user_ttl)
            .await
        {
            tracing::warn!(user_id = %user.user_id, error = %e, "user not cached");
        }
    }

    async fn remember_all(&self, users: &[User]) {
        let mut entries = Vec::with_capacity(users.len());
        for user in users {
            match serde_json::to_string(user) {
                Ok(raw) => entries.push((user_key(&user.user_id), raw)),
                Err(e) => tracing::warn!(user_id = %user.user_id, error = %e, "user not cached"),
            }
        }
        if let Err(e) = self
            .cache
            .store()
            .set_many(entries, self.config.user_ttl)
            .await
        {
            tracing::warn!(error = %e, "failed to cache searched users");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, InflightRegistry, MemoryStore};
    use crate::testing::FakeDirectory;
    use std::time::Duration;

    fn service(fake: &Arc<FakeDirectory>) -> (Users, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), InflightRegistry::default());
        (
            Users::new(fake.clone(), cache, UsersConfig::default()),
            store,
        )
    }

    fn user(id: &str) -> User {
        User::new(id, format!("{}@x.com", id.replace('|', "-")))
    }

    #[tokio::test]
    async fn test_get_user_prefers_cache() {
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1")]));
        let (users, store) = service(&fake);

        users.get_user("auth0|1", CacheMode::Prefer).await.unwrap();
        users.get_user("auth0|1", CacheMode::Prefer).await.unwrap();
        assert_eq!(fake.calls(), 1);
        assert!(store.get("user:auth0|1").await.unwrap().is_some());

        users.get_user("auth0|1", CacheMode::Refresh).await.unwrap();
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_are_deduplicated() {
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1")]));
        fake.set_latency(Duration::from_millis(50));
        let (users, _) = service(&fake);

        let (a, b) = tokio::join!(
            users.get_user("auth0|1", CacheMode::Refresh),
            users.get_user("auth0|1", CacheMode::Refresh),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_user_not_found() {
        let fake = Arc::new(FakeDirectory::default());
        let (users, store) = service(&fake);
        let err = users
            .get_user("auth0|nope", CacheMode::Prefer)
            .await
            .unwrap_err();
        assert_eq!(err, DirectoryError::NotFound("auth0|nope".into()));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_batch_fetch_keeps_caller_order() {
        let fake = Arc::new(FakeDirectory::with_users(vec![
            user("auth0|a"),
            user("auth0|b"),
            user("auth0|c"),
        ]));
        let (users, _) = service(&fake);
        users.get_user("auth0|a", CacheMode::Prefer).await.unwrap();
        users.get_user("auth0|c", CacheMode::Prefer).await.unwrap();
        let before = fake.searches().len();

        let ids: Vec<String> = ["auth0|a", "auth0|b", "auth0|c", "auth0|zz"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let got = users.get_users(&ids).await.unwrap();

        let got_ids: Vec<Option<&str>> = got
            .iter()
            .map(|u| u.as_ref().map(|u| u.user_id.as_str()))
            .collect();
        assert_eq!(
            got_ids,
            vec![Some("auth0|a"), Some("auth0|b"), Some("auth0|c"), None]
        );
        assert_eq!(fake.searches().len(), before + 1);
        assert_eq!(
            fake.searches().last().unwrap().q,
            r#"(user_id:"auth0|b" OR user_id:"auth0|zz")"#
        );
    }

    #[tokio::test]
    async fn test_batch_fetch_splits_and_survives_failed_sub_batch() {
        let all: Vec<User> = (0..70).map(|i| user(&format!("auth0|{i:03}"))).collect();
        let fake = Arc::new(FakeDirectory::with_users(all));
        fake.fail_searches_matching(r#"user_id:"auth0|000""#);
        let (users, _) = service(&fake);

        let ids: Vec<String> = (0..70).map(|i| format!("auth0|{i:03}")).collect();
        let got = users.get_users(&ids).await.unwrap();

        assert_eq!(fake.searches().len(), 2);
        assert!(got[..64].iter().all(Option::is_none));
        assert!(got[64..].iter().all(Option::is_some));
        assert_eq!(got[69].as_ref().unwrap().user_id, "auth0|069");
    }

    #[tokio::test]
    async fn test_update_strips_names_for_social_identities() {
        let fake = Arc::new(FakeDirectory::with_users(vec![
            user("auth0|1"),
            user("google-oauth2|2"),
        ]));
        let (users, _) = service(&fake);
        let data = UserUpdate {
            given_name: Some("Ada".into()),
            family_name: Some("Lovelace".into()),
            ..Default::default()
        };

        let db = users.update_user("auth0|1", &data).await.unwrap();
        assert_eq!(db.given_name.as_deref(), Some("Ada"));

        let social = users.update_user("google-oauth2|2", &data).await.unwrap();
        assert_eq!(social.given_name, None);
        assert_eq!(social.family_name, None);

        let cached = users
            .get_user("auth0|1", CacheMode::Prefer)
            .await
            .unwrap();
        assert_eq!(cached.family_name.as_deref(), Some("Lovelace"));
    }

    #[tokio::test]
    async fn test_delete_drops_cache_entry() {
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1")]));
        let (users, store) = service(&fake);
        users.get_user("auth0|1", CacheMode::Prefer).await.unwrap();

        users.delete_user("auth0|1").await.unwrap();
        assert!(store.get("user:auth0|1").await.unwrap().is_none());
        assert!(matches!(
            users.get_user("auth0|1", CacheMode::Prefer).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_users_by_email() {
        let mut twin = user("google-oauth2|9");
        twin.email = "auth0-1@x.com".into();
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1"), twin]));
        let (users, _) = service(&fake);

        assert_eq!(users.remove_users_by_email("auth0-1@x.com").await.unwrap(), 2);
        assert!(users.users_by_email("auth0-1@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_role_replaces_assignments_and_metadata() {
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1")]));
        let (users, _) = service(&fake);
        let u = users.get_user("auth0|1", CacheMode::Prefer).await.unwrap();

        let updated = users.set_role(&u, Role::Teacher).await.unwrap();
        assert_eq!(updated.role(), Some(Role::Teacher));
        assert_eq!(fake.role_names("auth0|1"), vec!["teacher"]);

        let updated = users.set_role(&updated, Role::Editor).await.unwrap();
        assert_eq!(fake.role_names("auth0|1"), vec!["editor"]);

        let calls = fake.calls();
        users.set_role(&updated, Role::Editor).await.unwrap();
        // user_roles only; the role list is cached and nothing changes.
        assert_eq!(fake.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_search_clamps_page_size_and_caches() {
        let all: Vec<User> = (0..3).map(|i| user(&format!("auth0|{i}"))).collect();
        let fake = Arc::new(FakeDirectory::with_users(all));
        let (users, store) = service(&fake);

        let page = users
            .search(&SearchOptions {
                per_page: Some(500),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(fake.searches()[0].per_page, MAX_PAGE_SIZE);
        assert_eq!(store.len().await, 3);

        users.search(&SearchOptions::default()).await.unwrap();
        assert_eq!(fake.searches()[1].per_page, 50);
    }

    #[tokio::test]
    async fn test_invalidate_prefix() {
        let fake = Arc::new(FakeDirectory::with_users(vec![user("auth0|1"), user("auth0|2")]));
        let (users, store) = service(&fake);
        users.get_user("auth0|1", CacheMode::Prefer).await.unwrap();
        users.get_user("auth0|2", CacheMode::Prefer).await.unwrap();
        users.roles().await.unwrap();

        assert_eq!(users.invalidate_prefix("user:").await.unwrap(), 2);
        assert_eq!(store.len().await, 1);
    }
}
