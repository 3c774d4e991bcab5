//! Persistent session store with bounded in-memory caches.
//!
//! Sessions live in the `sessions` table and are keyed by a 256-bit random
//! token. Two LRU caches sit in front of the table: one for single-session
//! lookups, one for per-user session-id lists. The caches are pure
//! memoization over the database and are dropped wholesale on every write.
//!
//! Sessions reference users by the immutable `user_id`, so they survive
//! username changes; `rename_user` rewrites the cached display name in
//! every live session for the user.

use std::num::NonZeroUsize;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::SqliteConnection;
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, warn};

use crate::db::model::SessionRow;
use crate::db::schema::sessions;
use crate::db::DbPool;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: i64,
    pub username: String,
    pub ip: String,
    pub created_at: i64,
    pub last_active: i64,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            user_id: row.user_id,
            username: row.username,
            ip: row.ip,
            created_at: row.created_at,
            last_active: row.last_active,
        }
    }
}

struct Caches {
    sessions: LruCache<String, Session>,
    user_sessions: LruCache<i64, Vec<String>>,
}

pub struct SessionStore {
    pool: DbPool,
    timeout: Duration,
    caches: Mutex<Caches>,
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// 256 bits from the OS CSPRNG, hex-encoded to the 64-character token.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut token = String::with_capacity(64);
    for b in bytes {
        token.push_str(&format!("{b:02x}"));
    }
    token
}

impl SessionStore {
    pub fn new(pool: DbPool, timeout: Duration, cache_size: usize, user_cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        let user_cache_size = NonZeroUsize::new(user_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            pool,
            timeout,
            caches: Mutex::new(Caches {
                sessions: LruCache::new(cache_size),
                user_sessions: LruCache::new(user_cache_size),
            }),
        }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool.get().map_err(|e| Error::Connection(e.to_string()))
    }

    fn invalidate(&self) {
        let mut caches = self.caches.lock();
        caches.sessions.clear();
        caches.user_sessions.clear();
    }

    fn expired(&self, last_active: i64, now: i64) -> bool {
        now - last_active > self.timeout.as_secs() as i64
    }

    /// Mint a session for an authenticated user and persist it.
    pub fn create(&self, user_id: i64, username: &str, ip: &str) -> Result<String> {
        let now = unix_now();
        let row = SessionRow {
            session_id: generate_token(),
            user_id,
            username: username.to_string(),
            ip: ip.to_string(),
            created_at: now,
            last_active: now,
        };

        let mut conn = self.conn()?;
        diesel::insert_into(sessions::table)
            .values(&row)
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        drop(conn);

        self.invalidate();
        Ok(row.session_id)
    }

    /// Look up a session, cache-first. Expired sessions are deleted on
    /// sight and reported as absent. Database failures are logged and
    /// reported as absent as well.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let now = unix_now();

        let cached = self.caches.lock().sessions.get(session_id).cloned();
        if let Some(session) = cached {
            if self.expired(session.last_active, now) {
                self.delete(session_id);
                return None;
            }
            return Some(session);
        }

        let row = match self.load_row(session_id) {
            Ok(row) => row?,
            Err(e) => {
                warn!(error = %e, "Session lookup failed");
                return None;
            }
        };

        if self.expired(row.last_active, now) {
            self.delete(session_id);
            return None;
        }

        let session = Session::from(row);
        self.caches
            .lock()
            .sessions
            .put(session_id.to_string(), session.clone());
        Some(session)
    }

    fn load_row(&self, session_id: &str) -> Result<Option<SessionRow>> {
        let mut conn = self.conn()?;
        sessions::table
            .find(session_id)
            .first::<SessionRow>(&mut conn)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Bump `last_active`. Caches are invalidated only when a row actually
    /// changed.
    pub fn touch(&self, session_id: &str) -> bool {
        let result = self.conn().and_then(|mut conn| {
            diesel::update(sessions::table.find(session_id))
                .set(sessions::last_active.eq(unix_now()))
                .execute(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(updated) if updated > 0 => {
                self.invalidate();
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "Session touch failed");
                false
            }
        }
    }

    /// Delete a session (logout). Returns false when it did not exist.
    pub fn delete(&self, session_id: &str) -> bool {
        let result = self.conn().and_then(|mut conn| {
            diesel::delete(sessions::table.find(session_id))
                .execute(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(deleted) if deleted > 0 => {
                self.invalidate();
                true
            }
            Ok(_) => false,
            Err(e) => {
                warn!(error = %e, "Session delete failed");
                false
            }
        }
    }

    /// Rewrite the cached username in every session of a user. Returns the
    /// number of sessions updated.
    pub fn rename_user(&self, user_id: i64, new_username: &str) -> usize {
        let result = self.conn().and_then(|mut conn| {
            diesel::update(sessions::table.filter(sessions::user_id.eq(user_id)))
                .set(sessions::username.eq(new_username))
                .execute(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(count) => {
                if count > 0 {
                    self.invalidate();
                    debug!(user_id, count, "Renamed user in sessions");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "Session rename failed");
                0
            }
        }
    }

    /// Ids of the user's live (non-expired) sessions, cache-first.
    pub fn user_sessions(&self, user_id: i64) -> Vec<String> {
        if let Some(ids) = self.caches.lock().user_sessions.get(&user_id) {
            return ids.clone();
        }

        let cutoff = unix_now() - self.timeout.as_secs() as i64;
        let result = self.conn().and_then(|mut conn| {
            sessions::table
                .filter(sessions::user_id.eq(user_id))
                .filter(sessions::last_active.ge(cutoff))
                .select(sessions::session_id)
                .load::<String>(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(ids) => {
                self.caches.lock().user_sessions.put(user_id, ids.clone());
                ids
            }
            Err(e) => {
                warn!(error = %e, "User session listing failed");
                Vec::new()
            }
        }
    }

    /// Delete every session of a user (password change, account deletion).
    pub fn logout_all(&self, user_id: i64) -> usize {
        let result = self.conn().and_then(|mut conn| {
            diesel::delete(sessions::table.filter(sessions::user_id.eq(user_id)))
                .execute(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(count) => {
                if count > 0 {
                    self.invalidate();
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "Session logout-all failed");
                0
            }
        }
    }

    /// Bulk-delete sessions idle past the timeout. Returns the row count.
    pub fn cleanup_expired(&self) -> usize {
        let cutoff = unix_now() - self.timeout.as_secs() as i64;
        let result = self.conn().and_then(|mut conn| {
            diesel::delete(sessions::table.filter(sessions::last_active.lt(cutoff)))
                .execute(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(count) => {
                if count > 0 {
                    self.invalidate();
                    debug!(count, "Cleaned up expired sessions");
                }
                count
            }
            Err(e) => {
                warn!(error = %e, "Session cleanup failed");
                0
            }
        }
    }

    /// Number of live (non-expired) sessions.
    pub fn active_count(&self) -> usize {
        let cutoff = unix_now() - self.timeout.as_secs() as i64;
        let result = self.conn().and_then(|mut conn| {
            sessions::table
                .filter(sessions::last_active.ge(cutoff))
                .count()
                .get_result::<i64>(&mut conn)
                .map_err(|e| Error::Database(e.to_string()))
        });
        match result {
            Ok(count) => count as usize,
            Err(e) => {
                warn!(error = %e, "Session count failed");
                0
            }
        }
    }
}
