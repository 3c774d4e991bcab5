//! User table operations: account CRUD, credentials, ratings and counters.
//!
//! Callers past the handler boundary treat failures as sentinels: `Ok(None)`
//! or `Ok(false)` mean the domain said no (duplicate username, missing row),
//! `Err` means the database itself failed and has been logged by the caller.

use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::SqliteConnection;
use serde::Serialize;

use super::model::NewUserRow;
use super::schema::users;
use super::DbPool;
use crate::auth;
use crate::error::{Error, Result};

/// Default rating for a freshly registered account.
pub const DEFAULT_ELO: i32 = 500;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub user_id: i64,
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub elo: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub join_date: String,
    pub last_game: Option<String>,
}

#[derive(Clone)]
pub struct UserStore {
    pool: DbPool,
}

impl UserStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool.get().map_err(|e| Error::Connection(e.to_string()))
    }

    /// Create a new account with the default rating and zeroed counters.
    ///
    /// Returns the new `user_id`, or `None` when the username is taken.
    pub fn create(&self, username: &str, password: &str) -> Result<Option<i64>> {
        let (password_hash, salt) = auth::hash_password(password)?;
        let row = NewUserRow {
            username,
            password_hash: &password_hash,
            salt: &salt,
            elo: DEFAULT_ELO,
            wins: 0,
            draws: 0,
            losses: 0,
            join_date: Utc::now().to_rfc3339(),
            last_game: None,
        };

        let mut conn = self.conn()?;
        match diesel::insert_into(users::table).values(&row).execute(&mut conn) {
            Ok(_) => {}
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => {
                return Ok(None);
            }
            Err(e) => return Err(Error::Database(e.to_string())),
        }

        let user_id = users::table
            .filter(users::username.eq(username))
            .select(users::user_id)
            .first::<i64>(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(Some(user_id))
    }

    /// Credentials lookup for login. `None` when the username is unknown.
    pub fn credentials(&self, username: &str) -> Result<Option<Credentials>> {
        let mut conn = self.conn()?;
        let row = users::table
            .filter(users::username.eq(username))
            .select((users::user_id, users::password_hash))
            .first::<(i64, String)>(&mut conn)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|(user_id, password_hash)| Credentials {
            user_id,
            password_hash,
        }))
    }

    pub fn stats(&self, user_id: i64) -> Result<Option<UserStats>> {
        let mut conn = self.conn()?;
        let row = users::table
            .find(user_id)
            .select((
                users::elo,
                users::wins,
                users::draws,
                users::losses,
                users::join_date,
                users::last_game,
            ))
            .first::<(i32, i32, i32, i32, String, Option<String>)>(&mut conn)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(row.map(|(elo, wins, draws, losses, join_date, last_game)| UserStats {
            elo,
            wins,
            draws,
            losses,
            join_date,
            last_game,
        }))
    }

    pub fn elo(&self, user_id: i64) -> Result<Option<i32>> {
        let mut conn = self.conn()?;
        users::table
            .find(user_id)
            .select(users::elo)
            .first::<i32>(&mut conn)
            .optional()
            .map_err(|e| Error::Database(e.to_string()))
    }

    /// Overwrite a player's rating. Returns false when the user is gone.
    pub fn update_elo(&self, user_id: i64, elo: i32) -> Result<bool> {
        let mut conn = self.conn()?;
        let updated = diesel::update(users::table.find(user_id))
            .set(users::elo.eq(elo))
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(updated > 0)
    }

    /// Record a decisive result: winner's wins and loser's losses both
    /// increment, and both `last_game` stamps move to now.
    pub fn record_win(&self, winner_id: i64, loser_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        conn.transaction::<_, DieselError, _>(|conn| {
            diesel::update(users::table.find(winner_id))
                .set((users::wins.eq(users::wins + 1), users::last_game.eq(&now)))
                .execute(conn)?;
            diesel::update(users::table.find(loser_id))
                .set((users::losses.eq(users::losses + 1), users::last_game.eq(&now)))
                .execute(conn)?;
            Ok(())
        })
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Record a draw for both players.
    pub fn record_draw(&self, player1_id: i64, player2_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        conn.transaction::<_, DieselError, _>(|conn| {
            for user_id in [player1_id, player2_id] {
                diesel::update(users::table.find(user_id))
                    .set((users::draws.eq(users::draws + 1), users::last_game.eq(&now)))
                    .execute(conn)?;
            }
            Ok(())
        })
        .map_err(|e| Error::Database(e.to_string()))
    }

    /// Change a username. Returns false when the new name is already taken.
    pub fn rename(&self, user_id: i64, new_username: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        match diesel::update(users::table.find(user_id))
            .set(users::username.eq(new_username))
            .execute(&mut conn)
        {
            Ok(n) => Ok(n > 0),
            Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)) => Ok(false),
            Err(e) => Err(Error::Database(e.to_string())),
        }
    }

    /// Replace a user's password hash and salt.
    pub fn update_password(&self, user_id: i64, new_password: &str) -> Result<bool> {
        let (password_hash, salt) = auth::hash_password(new_password)?;
        let mut conn = self.conn()?;
        let updated = diesel::update(users::table.find(user_id))
            .set((
                users::password_hash.eq(password_hash),
                users::salt.eq(salt),
            ))
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(updated > 0)
    }

    /// Delete an account. Returns false when the user was already gone.
    pub fn delete(&self, user_id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let deleted = diesel::delete(users::table.find(user_id))
            .execute(&mut conn)
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};
    use tempfile::TempDir;

    fn store() -> (TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("users.db");
        let pool = create_pool(url.to_str().unwrap()).unwrap();
        run_migrations(&pool).unwrap();
        (dir, UserStore::new(pool))
    }

    #[test]
    fn create_then_login_round_trip() {
        let (_dir, store) = store();
        let user_id = store.create("alice", "password1234").unwrap().unwrap();

        let creds = store.credentials("alice").unwrap().unwrap();
        assert_eq!(creds.user_id, user_id);
        assert!(auth::verify_password("password1234", &creds.password_hash));
        assert!(!auth::verify_password("wrong-password", &creds.password_hash));
    }

    #[test]
    fn duplicate_username_is_reported_as_none() {
        let (_dir, store) = store();
        assert!(store.create("alice", "password1234").unwrap().is_some());
        assert!(store.create("alice", "password5678").unwrap().is_none());
    }

    #[test]
    fn new_users_start_at_default_rating() {
        let (_dir, store) = store();
        let user_id = store.create("alice", "password1234").unwrap().unwrap();
        let stats = store.stats(user_id).unwrap().unwrap();
        assert_eq!(stats.elo, DEFAULT_ELO);
        assert_eq!((stats.wins, stats.draws, stats.losses), (0, 0, 0));
        assert_eq!(stats.last_game, None);
    }

    #[test]
    fn record_win_updates_both_counters() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        let bob = store.create("bob", "password1234").unwrap().unwrap();

        store.record_win(alice, bob).unwrap();

        let a = store.stats(alice).unwrap().unwrap();
        let b = store.stats(bob).unwrap().unwrap();
        assert_eq!(a.wins, 1);
        assert_eq!(b.losses, 1);
        assert!(a.last_game.is_some());
        assert!(b.last_game.is_some());
    }

    #[test]
    fn record_draw_updates_both_counters() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        let bob = store.create("bob", "password1234").unwrap().unwrap();

        store.record_draw(alice, bob).unwrap();

        assert_eq!(store.stats(alice).unwrap().unwrap().draws, 1);
        assert_eq!(store.stats(bob).unwrap().unwrap().draws, 1);
    }

    #[test]
    fn rename_detects_collisions() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        store.create("bob", "password1234").unwrap().unwrap();

        assert!(!store.rename(alice, "bob").unwrap());
        assert!(store.rename(alice, "carol").unwrap());
        assert!(store.credentials("carol").unwrap().is_some());
        assert!(store.credentials("alice").unwrap().is_none());
    }

    #[test]
    fn password_update_replaces_hash() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        assert!(store.update_password(alice, "another-passphrase").unwrap());

        let creds = store.credentials("alice").unwrap().unwrap();
        assert!(auth::verify_password("another-passphrase", &creds.password_hash));
        assert!(!auth::verify_password("password1234", &creds.password_hash));
    }

    #[test]
    fn delete_removes_the_account() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        assert!(store.delete(alice).unwrap());
        assert!(!store.delete(alice).unwrap());
        assert!(store.stats(alice).unwrap().is_none());
    }

    #[test]
    fn update_elo_round_trips() {
        let (_dir, store) = store();
        let alice = store.create("alice", "password1234").unwrap().unwrap();
        assert!(store.update_elo(alice, 516).unwrap());
        assert_eq!(store.elo(alice).unwrap(), Some(516));
        assert!(!store.update_elo(9999, 400).unwrap());
    }
}
