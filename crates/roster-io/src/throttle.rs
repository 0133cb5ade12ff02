//! # Throttle: Rate-Limited Remote Caller
//!
//! A global budget for upstream calls: at most `rate` admissions in any
//! sliding `interval`, and at most `concurrency` calls running at once.
//! Excess callers queue in submission order and are released as budget
//! frees up.
//!
//! [`Throttled`] wraps any [`Directory`] so that every method goes through
//! one shared [`Throttle`]. Errors from the wrapped call are returned
//! unchanged and never retried.

use crate::directory::{Directory, RoleInfo, SearchRequest};
use crate::error::{Aborted, DirectoryError};
use roster_core::{User, UserPage, UserUpdate};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::Instant;

/// Upstream call budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLimits {
    pub interval: Duration,
    /// Admissions per interval.
    pub rate: usize,
    /// Calls in flight at once.
    pub concurrency: usize,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            rate: 2,
            concurrency: 10,
        }
    }
}

pub struct Throttle {
    limits: ThrottleLimits,
    /// Start times of recent admissions. The mutex is also the FIFO queue:
    /// tokio's `Mutex` grants the lock in request order.
    window: Mutex<VecDeque<Instant>>,
    concurrency: Semaphore,
}

impl Throttle {
    pub fn new(limits: ThrottleLimits) -> Self {
        let limits = ThrottleLimits {
            rate: limits.rate.max(1),
            concurrency: limits.concurrency.max(1),
            ..limits
        };
        Self {
            limits,
            window: Mutex::new(VecDeque::with_capacity(limits.rate)),
            concurrency: Semaphore::new(limits.concurrency),
        }
    }

    pub fn limits(&self) -> ThrottleLimits {
        self.limits
    }

    /// Wait for a slot in both budgets. The returned permit holds the
    /// concurrency slot until dropped.
    pub async fn admit(&self) -> Result<SemaphorePermit<'_>, Aborted> {
        let mut window = self.window.lock().await;
        let permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| Aborted("throttle closed".into()))?;

        loop {
            let now = Instant::now();
            while let Some(&oldest) = window.front() {
                if now.duration_since(oldest) >= self.limits.interval {
                    window.pop_front();
                } else {
                    break;
                }
            }
            if window.len() < self.limits.rate {
                window.push_back(now);
                return Ok(permit);
            }
            if let Some(&oldest) = window.front() {
                tokio::time::sleep_until(oldest + self.limits.interval).await;
            }
        }
    }

    /// Run `f` once budget allows. Whatever `f` returns is passed back as is.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Aborted>,
    {
        let _permit = self.admit().await?;
        f().await
    }
}

/// A [`Directory`] whose every call is admitted by a shared [`Throttle`].
pub struct Throttled {
    inner: Arc<dyn Directory>,
    throttle: Arc<Throttle>,
}

impl Throttled {
    pub fn new(inner: Arc<dyn Directory>, throttle: Arc<Throttle>) -> Self {
        Self { inner, throttle }
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }
}

#[async_trait::async_trait]
impl Directory for Throttled {
    async fn search(&self, request: &SearchRequest) -> Result<UserPage, DirectoryError> {
        tracing::debug!(q = %request.q, sort = ?request.sort, page = request.page, "upstream search");
        self.throttle.call(|| self.inner.search(request)).await
    }

    async fn get_user(&self, id: &str) -> Result<User, DirectoryError> {
        self.throttle.call(|| self.inner.get_user(id)).await
    }

    async fn create_user(&self, data: &UserUpdate) -> Result<User, DirectoryError> {
        self.throttle.call(|| self.inner.create_user(data)).await
    }

    async fn update_user(&self, id: &str, data: &UserUpdate) -> Result<User, DirectoryError> {
        self.throttle.call(|| self.inner.update_user(id, data)).await
    }

    async fn delete_user(&self, id: &str) -> Result<(), DirectoryError> {
        self.throttle.call(|| self.inner.delete_user(id)).await
    }

    async fn users_by_email(&self, email: &str) -> Result<Vec<User>, DirectoryError> {
        self.throttle.call(|| self.inner.users_by_email(email)).await
    }

    async fn user_permissions(&self, id: &str) -> Result<Vec<String>, DirectoryError> {
        self.throttle.call(|| self.inner.user_permissions(id)).await
    }

    async fn roles(&self) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.throttle.call(|| self.inner.roles()).await
    }

    async fn user_roles(&self, id: &str) -> Result<Vec<RoleInfo>, DirectoryError> {
        self.throttle.call(|| self.inner.user_roles(id)).await
    }

    async fn assign_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.throttle
            .call(|| self.inner.assign_roles(id, role_ids))
            .await
    }

    async fn remove_roles(&self, id: &str, role_ids: &[String]) -> Result<(), DirectoryError> {
        self.throttle
            .call(|| self.inner.remove_roles(id, role_ids))
            .await
    }
}
