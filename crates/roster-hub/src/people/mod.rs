//! # Local People
//!
//! Local shadow records for upstream users, keyed by the upstream id, plus
//! parent/child family links. A user who logs in through a different linked
//! identity keeps the same person: lookups match every `provider|user_id`
//! identity and re-bind the record to the user's current primary id.

use roster_core::User;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A child has at most this many parents.
pub const MAX_PARENTS: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Person {
    pub id: u64,
    /// Primary upstream id of the user this person shadows.
    pub user_id: String,
    pub created_at: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FamilyError {
    #[error("person {0} not found")]
    UnknownPerson(u64),
    #[error("a person cannot be their own parent")]
    SelfLink,
    #[error("person {0} already has {MAX_PARENTS} parents")]
    TooManyParents(u64),
}

#[derive(Default)]
struct Index {
    people: HashMap<u64, Person>,
    by_user_id: HashMap<String, u64>,
    /// (parent, child)
    families: Vec<(u64, u64)>,
    next_id: u64,
}

impl Index {
    fn create(&mut self, user_id: &str) -> Person {
        self.next_id += 1;
        let person = Person {
            id: self.next_id,
            user_id: user_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.people.insert(person.id, person.clone());
        self.by_user_id.insert(person.user_id.clone(), person.id);
        person
    }

    fn rebind(&mut self, id: u64, user_id: &str) -> Option<Person> {
        let person = self.people.get_mut(&id)?;
        if person.user_id != user_id {
            tracing::info!(person = id, from = %person.user_id, to = %user_id, "person re-bound");
            self.by_user_id.remove(&person.user_id);
            person.user_id = user_id.to_string();
            self.by_user_id.insert(user_id.to_string(), id);
        }
        Some(person.clone())
    }

    fn find_or_create(&mut self, user: &User) -> Person {
        let existing = user
            .external_ids()
            .iter()
            .find_map(|id| self.by_user_id.get(id).copied());
        match existing.and_then(|id| self.rebind(id, &user.user_id)) {
            Some(person) => person,
            None => self.create(&user.user_id),
        }
    }
}

#[derive(Default)]
pub struct PeopleStore {
    index: RwLock<Index>,
}

impl PeopleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn find_or_create(&self, user: &User) -> Person {
        self.index.write().await.find_or_create(user)
    }

    /// One person per user, in user order, under a single lock.
    pub async fn find_or_create_many(&self, users: &[User]) -> Vec<Person> {
        let mut index = self.index.write().await;
        users.iter().map(|u| index.find_or_create(u)).collect()
    }

    pub async fn get(&self, id: u64) -> Option<Person> {
        self.index.read().await.people.get(&id).cloned()
    }

    pub async fn by_user_id(&self, user_id: &str) -> Option<Person> {
        let index = self.index.read().await;
        index
            .by_user_id
            .get(user_id)
            .and_then(|id| index.people.get(id))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.people.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Link `child` under `parent`. Linking twice is a no-op.
    pub async fn add_child(&self, parent: u64, child: u64) -> Result<(), FamilyError> {
        if parent == child {
            return Err(FamilyError::SelfLink);
        }
        let mut index = self.index.write().await;
        for id in [parent, child] {
            if !index.people.contains_key(&id) {
                return Err(FamilyError::UnknownPerson(id));
            }
        }
        if index.families.contains(&(parent, child)) {
            return Ok(());
        }
        let parents = index.families.iter().filter(|(_, c)| *c == child).count();
        if parents >= MAX_PARENTS {
            return Err(FamilyError::TooManyParents(child));
        }
        index.families.push((parent, child));
        Ok(())
    }

    pub async fn children(&self, parent: u64) -> Vec<Person> {
        let index = self.index.read().await;
        index
            .families
            .iter()
            .filter(|(p, _)| *p == parent)
            .filter_map(|(_, c)| index.people.get(c).cloned())
            .collect()
    }

    pub async fn parents(&self, child: u64) -> Vec<Person> {
        let index = self.index.read().await;
        index
            .families
            .iter()
            .filter(|(_, c)| *c == child)
            .filter_map(|(p, _)| index.people.get(p).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::Identity;

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = PeopleStore::new();
        let user = User::new("auth0|1", "a@x.com");
        let first = store.find_or_create(&user).await;
        let second = store.find_or_create(&user).await;
        assert_eq!(first, second);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_linked_identity_rebinds_person() {
        let store = PeopleStore::new();
        let before = store
            .find_or_create(&User::new("google-oauth2|7", "a@x.com"))
            .await;

        let mut merged = User::new("auth0|1", "a@x.com");
        merged.identities.push(Identity {
            provider: "google-oauth2".into(),
            user_id: "7".into(),
        });
        let after = store.find_or_create(&merged).await;

        assert_eq!(after.id, before.id);
        assert_eq!(after.user_id, "auth0|1");
        assert!(store.by_user_id("google-oauth2|7").await.is_none());
        assert_eq!(store.by_user_id("auth0|1").await.unwrap().id, before.id);
    }

    #[tokio::test]
    async fn test_batch_keeps_user_order() {
        let store = PeopleStore::new();
        let existing = store.find_or_create(&User::new("auth0|b", "b@x.com")).await;
        let users = vec![
            User::new("auth0|a", "a@x.com"),
            User::new("auth0|b", "b@x.com"),
            User::new("auth0|c", "c@x.com"),
        ];
        let people = store.find_or_create_many(&users).await;
        let ids: Vec<&str> = people.iter().map(|p| p.user_id.as_str()).collect();
        assert_eq!(ids, vec!["auth0|a", "auth0|b", "auth0|c"]);
        assert_eq!(people[1].id, existing.id);
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_family_links() {
        let store = PeopleStore::new();
        let users: Vec<User> = (0..4)
            .map(|i| User::new(format!("auth0|{i}"), format!("{i}@x.com")))
            .collect();
        let p = store.find_or_create_many(&users).await;
        let (mum, dad, gran, kid) = (p[0].id, p[1].id, p[2].id, p[3].id);

        store.add_child(mum, kid).await.unwrap();
        store.add_child(mum, kid).await.unwrap();
        store.add_child(dad, kid).await.unwrap();
        assert_eq!(
            store.add_child(gran, kid).await,
            Err(FamilyError::TooManyParents(kid))
        );
        assert_eq!(store.add_child(kid, kid).await, Err(FamilyError::SelfLink));
        assert_eq!(
            store.add_child(mum, 99).await,
            Err(FamilyError::UnknownPerson(99))
        );

        assert_eq!(store.children(mum).await.len(), 1);
        assert_eq!(store.parents(kid).await.len(), 2);
        assert!(store.children(kid).await.is_empty());
    }
}
