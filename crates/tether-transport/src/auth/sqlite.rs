//! SQLite-backed auth grant store.
//!
//! The durable production counterpart to [`super::MemoryAuthStore`], for
//! single-instance deployments where grants must survive restarts.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AuthError, AuthStore, Grant};

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        AuthError::Store(err.to_string())
    }
}

/// Configuration for the SQLite grant store.
#[derive(Debug, Clone)]
pub struct SqliteAuthConfig {
    pub database_path: PathBuf,
    pub idle_ttl: std::time::Duration,
    pub max_ttl: std::time::Duration,
    pub rotate_grace: std::time::Duration,
}

impl Default for SqliteAuthConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tether_auth.db"),
            idle_ttl: std::time::Duration::from_secs(14 * 24 * 3600),
            max_ttl: std::time::Duration::from_secs(90 * 24 * 3600),
            rotate_grace: std::time::Duration::from_secs(30),
        }
    }
}

/// SQLite-backed [`AuthStore`].
pub struct SqliteAuthStore {
    pool: SqlitePool,
    idle_ttl: ChronoDuration,
    max_ttl: ChronoDuration,
    rotate_grace: ChronoDuration,
}

impl SqliteAuthStore {
    pub async fn new(config: SqliteAuthConfig) -> Result<Self, AuthError> {
        info!(path = ?config.database_path, "initializing sqlite auth store");
        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self {
            pool,
            idle_ttl: ChronoDuration::from_std(config.idle_ttl)
                .unwrap_or(ChronoDuration::zero()),
            max_ttl: ChronoDuration::from_std(config.max_ttl).unwrap_or(ChronoDuration::zero()),
            rotate_grace: ChronoDuration::from_std(config.rotate_grace)
                .unwrap_or(ChronoDuration::zero()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory database, for tests. Pinned to a single connection so every
    /// query sees the same database.
    pub async fn in_memory(
        idle_ttl: std::time::Duration,
        max_ttl: std::time::Duration,
        rotate_grace: std::time::Duration,
    ) -> Result<Self, AuthError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            idle_ttl: ChronoDuration::from_std(idle_ttl).unwrap_or(ChronoDuration::zero()),
            max_ttl: ChronoDuration::from_std(max_ttl).unwrap_or(ChronoDuration::zero()),
            rotate_grace: ChronoDuration::from_std(rotate_grace)
                .unwrap_or(ChronoDuration::zero()),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), AuthError> {
        debug!("running auth store migrations");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_grants (
                id TEXT PRIMARY KEY,
                family_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                scopes TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                last_used_at INTEGER NOT NULL,
                expires_at INTEGER,
                max_expires_at INTEGER,
                ua_hash TEXT,
                ip_hint TEXT,
                meta TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_auth_grants_family ON auth_grants (family_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn apply_defaults(&self, grant: &mut Grant, now: DateTime<Utc>) {
        if grant.expires_at.is_none() && self.idle_ttl > ChronoDuration::zero() {
            grant.expires_at = Some(now + self.idle_ttl);
        }
        if grant.max_expires_at.is_none() && self.max_ttl > ChronoDuration::zero() {
            grant.max_expires_at = Some(now + self.max_ttl);
        }
    }

    fn row_to_grant(row: &sqlx::sqlite::SqliteRow) -> Result<Grant, AuthError> {
        let scopes: String = row.try_get("scopes")?;
        let meta: String = row.try_get("meta")?;
        Ok(Grant {
            id: row.try_get("id")?,
            family_id: row.try_get("family_id")?,
            subject: row.try_get("subject")?,
            scopes: serde_json::from_str(&scopes)
                .map_err(|e| AuthError::Store(e.to_string()))?,
            created_at: millis_to_utc(row.try_get("created_at")?),
            last_used_at: millis_to_utc(row.try_get("last_used_at")?),
            expires_at: row
                .try_get::<Option<i64>, _>("expires_at")?
                .map(millis_to_utc),
            max_expires_at: row
                .try_get::<Option<i64>, _>("max_expires_at")?
                .map(millis_to_utc),
            ua_hash: row.try_get("ua_hash")?,
            ip_hint: row.try_get("ip_hint")?,
            meta: serde_json::from_str::<HashMap<String, String>>(&meta)
                .map_err(|e| AuthError::Store(e.to_string()))?,
        })
    }

    async fn insert(&self, grant: &Grant) -> Result<(), AuthError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO auth_grants
                (id, family_id, subject, scopes, created_at, last_used_at,
                 expires_at, max_expires_at, ua_hash, ip_hint, meta)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&grant.id)
        .bind(&grant.family_id)
        .bind(&grant.subject)
        .bind(serde_json::to_string(&grant.scopes).map_err(|e| AuthError::Store(e.to_string()))?)
        .bind(grant.created_at.timestamp_millis())
        .bind(grant.last_used_at.timestamp_millis())
        .bind(grant.expires_at.map(|at| at.timestamp_millis()))
        .bind(grant.max_expires_at.map(|at| at.timestamp_millis()))
        .bind(&grant.ua_hash)
        .bind(&grant.ip_hint)
        .bind(serde_json::to_string(&grant.meta).map_err(|e| AuthError::Store(e.to_string()))?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn put(&self, mut grant: Grant) -> Result<(), AuthError> {
        self.apply_defaults(&mut grant, Utc::now());
        self.insert(&grant).await
    }

    async fn get(&self, id: &str) -> Result<Grant, AuthError> {
        let row = sqlx::query("SELECT * FROM auth_grants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::NotFound)?;
        let grant = Self::row_to_grant(&row)?;
        if grant.expired_at(Utc::now()) {
            sqlx::query("DELETE FROM auth_grants WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            return Err(AuthError::NotFound);
        }
        Ok(grant)
    }

    async fn touch(&self, id: &str, at: DateTime<Utc>) -> Result<(), AuthError> {
        let mut next_expiry = None;
        if self.idle_ttl > ChronoDuration::zero() {
            next_expiry = Some((at + self.idle_ttl).timestamp_millis());
        }
        let updated = sqlx::query(
            r#"
            UPDATE auth_grants
            SET last_used_at = ?,
                expires_at = CASE
                    WHEN ? IS NULL THEN expires_at
                    WHEN max_expires_at IS NOT NULL AND ? > max_expires_at THEN max_expires_at
                    ELSE ?
                END
            WHERE id = ?
            "#,
        )
        .bind(at.timestamp_millis())
        .bind(next_expiry)
        .bind(next_expiry)
        .bind(next_expiry)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn rotate(&self, old_id: &str, template: Grant) -> Result<String, AuthError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT family_id FROM auth_grants WHERE id = ?")
            .bind(old_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AuthError::NotFound)?;
        let family_id: String = row.try_get("family_id")?;

        let mut fresh = template;
        if fresh.id.is_empty() {
            fresh.id = Uuid::now_v7().to_string();
        }
        fresh.family_id = family_id;
        fresh.created_at = now;
        fresh.last_used_at = now;
        self.apply_defaults(&mut fresh, now);

        sqlx::query(
            r#"
            INSERT INTO auth_grants
                (id, family_id, subject, scopes, created_at, last_used_at,
                 expires_at, max_expires_at, ua_hash, ip_hint, meta)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&fresh.id)
        .bind(&fresh.family_id)
        .bind(&fresh.subject)
        .bind(serde_json::to_string(&fresh.scopes).map_err(|e| AuthError::Store(e.to_string()))?)
        .bind(fresh.created_at.timestamp_millis())
        .bind(fresh.last_used_at.timestamp_millis())
        .bind(fresh.expires_at.map(|at| at.timestamp_millis()))
        .bind(fresh.max_expires_at.map(|at| at.timestamp_millis()))
        .bind(&fresh.ua_hash)
        .bind(&fresh.ip_hint)
        .bind(serde_json::to_string(&fresh.meta).map_err(|e| AuthError::Store(e.to_string()))?)
        .execute(&mut *tx)
        .await?;

        if self.rotate_grace > ChronoDuration::zero() {
            let grace_end = (now + self.rotate_grace).timestamp_millis();
            sqlx::query("UPDATE auth_grants SET expires_at = ? WHERE id = ?")
                .bind(grace_end)
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(fresh.id)
    }

    async fn revoke(&self, id: &str) -> Result<(), AuthError> {
        let deleted = sqlx::query("DELETE FROM auth_grants WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(AuthError::NotFound);
        }
        Ok(())
    }

    async fn revoke_family(&self, family_id: &str) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_grants WHERE family_id = ?")
            .bind(family_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
