//! Server-held authentication grants for BFF deployments.
//!
//! A grant is referenced by an opaque cookie-borne id, never by tokens on the
//! client. Grants carry a sliding idle expiry and an absolute cap, rotate on
//! use with a short grace window for in-flight requests, and group into
//! families so a logout can revoke every rotated descendant at once.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A durable BFF authentication grant.
#[derive(Debug, Clone)]
pub struct Grant {
    /// Opaque identifier stored in the httpOnly cookie.
    pub id: String,
    /// Groups rotated grants for logout-all semantics.
    pub family_id: String,
    /// Authenticated principal (user id, account id).
    pub subject: String,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Sliding idle expiry.
    pub expires_at: Option<DateTime<Utc>>,
    /// Absolute expiry cap.
    pub max_expires_at: Option<DateTime<Utc>>,
    /// Device binding hints; matching should stay tolerant.
    pub ua_hash: Option<String>,
    pub ip_hint: Option<String>,
    pub meta: HashMap<String, String>,
}

impl Grant {
    pub fn new(subject: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            family_id: Uuid::now_v7().to_string(),
            subject: subject.into(),
            scopes: Vec::new(),
            created_at: now,
            last_used_at: now,
            expires_at: None,
            max_expires_at: None,
            ua_hash: None,
            ip_hint: None,
            meta: HashMap::new(),
        }
    }

    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
            || self.max_expires_at.is_some_and(|at| now > at)
    }
}

/// Auth store failures. These stay internal to the server; nothing here
/// crosses the wire.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("auth grant not found")]
    NotFound,

    #[error("auth store failure: {0}")]
    Store(String),
}

/// Contract for a BFF grant store. Implementations must tolerate concurrent
/// readers and writers; rotation is atomic.
#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Inserts or updates a grant, defaulting sliding and absolute expiries
    /// from the store's TTL settings when unset.
    async fn put(&self, grant: Grant) -> Result<(), AuthError>;

    /// Returns a deep copy of the grant, or `NotFound` when missing or past
    /// either expiry (expired grants are revoked on the way out).
    async fn get(&self, id: &str) -> Result<Grant, AuthError>;

    /// Advances `last_used_at` and recomputes the sliding expiry, clamped to
    /// the absolute cap.
    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), AuthError>;

    /// Atomically creates a new grant in the same family and shrinks the old
    /// grant's expiry to the rotate-grace window. Returns the new id.
    async fn rotate(&self, old_id: &str, template: Grant) -> Result<String, AuthError>;

    async fn revoke(&self, id: &str) -> Result<(), AuthError>;

    async fn revoke_family(&self, family_id: &str) -> Result<(), AuthError>;
}

struct MemoryInner {
    by_id: HashMap<String, Grant>,
    by_family: HashMap<String, HashSet<String>>,
}

/// In-process grant store for development and tests.
pub struct MemoryAuthStore {
    idle_ttl: ChronoDuration,
    max_ttl: ChronoDuration,
    rotate_grace: ChronoDuration,
    inner: RwLock<MemoryInner>,
}

impl MemoryAuthStore {
    pub fn new(
        idle_ttl: std::time::Duration,
        max_ttl: std::time::Duration,
        rotate_grace: std::time::Duration,
    ) -> Self {
        Self {
            idle_ttl: ChronoDuration::from_std(idle_ttl).unwrap_or(ChronoDuration::zero()),
            max_ttl: ChronoDuration::from_std(max_ttl).unwrap_or(ChronoDuration::zero()),
            rotate_grace: ChronoDuration::from_std(rotate_grace).unwrap_or(ChronoDuration::zero()),
            inner: RwLock::new(MemoryInner {
                by_id: HashMap::new(),
                by_family: HashMap::new(),
            }),
        }
    }

    fn apply_defaults(&self, grant: &mut Grant, now: DateTime<Utc>) {
        if grant.expires_at.is_none() && self.idle_ttl > ChronoDuration::zero() {
            grant.expires_at = Some(now + self.idle_ttl);
        }
        if grant.max_expires_at.is_none() && self.max_ttl > ChronoDuration::zero() {
            grant.max_expires_at = Some(now + self.max_ttl);
        }
    }

    fn index(inner: &mut MemoryInner, grant: Grant) {
        inner
            .by_family
            .entry(grant.family_id.clone())
            .or_default()
            .insert(grant.id.clone());
        inner.by_id.insert(grant.id.clone(), grant);
    }

    fn unindex(inner: &mut MemoryInner, id: &str) -> Option<Grant> {
        let grant = inner.by_id.remove(id)?;
        if let Some(family) = inner.by_family.get_mut(&grant.family_id) {
            family.remove(id);
            if family.is_empty() {
                inner.by_family.remove(&grant.family_id);
            }
        }
        Some(grant)
    }
}

#[async_trait]
impl AuthStore for MemoryAuthStore {
    async fn put(&self, mut grant: Grant) -> Result<(), AuthError> {
        let now = Utc::now();
        self.apply_defaults(&mut grant, now);
        let mut inner = self.inner.write().await;
        Self::index(&mut inner, grant);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Grant, AuthError> {
        let now = Utc::now();
        {
            let inner = self.inner.read().await;
            match inner.by_id.get(id) {
                Some(grant) if !grant.expired_at(now) => return Ok(grant.clone()),
                Some(_expired) => {}
                None => return Err(AuthError::NotFound),
            }
        }
        // expired: revoke on the way out
        let mut inner = self.inner.write().await;
        Self::unindex(&mut inner, id);
        Err(AuthError::NotFound)
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        let grant = inner.by_id.get_mut(id).ok_or(AuthError::NotFound)?;
        grant.last_used_at = at;
        if self.idle_ttl > ChronoDuration::zero() {
            let mut next = at + self.idle_ttl;
            if let Some(cap) = grant.max_expires_at {
                if next > cap {
                    next = cap;
                }
            }
            grant.expires_at = Some(next);
        }
        Ok(())
    }

    async fn rotate(&self, old_id: &str, template: Grant) -> Result<String, AuthError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let family_id = inner
            .by_id
            .get(old_id)
            .ok_or(AuthError::NotFound)?
            .family_id
            .clone();

        let mut fresh = template;
        if fresh.id.is_empty() {
            fresh.id = Uuid::now_v7().to_string();
        }
        fresh.family_id = family_id;
        fresh.created_at = now;
        fresh.last_used_at = now;
        self.apply_defaults(&mut fresh, now);
        let new_id = fresh.id.clone();
        Self::index(&mut inner, fresh);

        if self.rotate_grace > ChronoDuration::zero() {
            if let Some(old) = inner.by_id.get_mut(old_id) {
                old.expires_at = Some(now + self.rotate_grace);
            }
        }
        Ok(new_id)
    }

    async fn revoke(&self, id: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        Self::unindex(&mut inner, id)
            .map(|_| ())
            .ok_or(AuthError::NotFound)
    }

    async fn revoke_family(&self, family_id: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.by_family.remove(family_id) {
            for id in members {
                inner.by_id.remove(&id);
            }
        }
        Ok(())
    }
}
