//! # Upstream Directory
//!
//! The contract every upstream user directory implements. Components never
//! hold a raw implementation: they receive a
//! [`Throttled`](crate::throttle::Throttled) one, so every call is budgeted.

use crate::error::DirectoryError;
use roster_core::{User, UserPage, UserUpdate};
use serde::{Deserialize, Serialize};

/// One upstream search call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    /// Compiled query string.
    pub q: String,
    /// `field:1` / `field:-1`.
    pub sort: Option<String>,
    pub page: u32,
    /// At most [`MAX_PAGE_SIZE`](roster_core::MAX_PAGE_SIZE).
    pub per_page: u32,
    pub include_totals: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub id: String,
    pub name: String,
}

#[async_trait::async_trait]
pub trait Directory: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<UserPage, DirectoryError>;

    /// `DirectoryError::NotFound` when the id is unknown.
    async fn get_user(&self, id: &str) -> Result<User, DirectoryError>;

    async fn create_user(&self, data: &UserUpdate) -> Result<User, DirectoryError>;

    async fn update_user(&self, id: &str, data: &UserUpdate) -> Result<User, DirectoryError>;

    async fn delete_user(&self, id: &str) -> Result<(), DirectoryError>;

    async fn users_by_email(&self, email: &str) -> Result<Vec<User>, DirectoryError>;

    async fn user_permissions(&self, id: &str) -> Result<Vec<String>, DirectoryError>;

    /// Every role defined in the tenant.
    async fn roles(&self) -> Result<Vec<RoleInfo>, DirectoryError>;

    async fn user_roles(&self, id: &str) -> Result<Vec<RoleInfo>, DirectoryError>;

    async fn assign_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError>;

    async fn remove_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError>;
}
