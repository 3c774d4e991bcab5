//! Row types for the persisted tables.

use diesel::prelude::*;

use super::schema::{sessions, users};

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = users)]
pub struct UserRow {
    pub user_id: i64,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub elo: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub join_date: String,
    pub last_game: Option<String>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = users)]
pub struct NewUserRow<'a> {
    pub username: &'a str,
    pub password_hash: &'a str,
    pub salt: &'a str,
    pub elo: i32,
    pub wins: i32,
    pub draws: i32,
    pub losses: i32,
    pub join_date: String,
    pub last_game: Option<String>,
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = sessions)]
pub struct SessionRow {
    pub session_id: String,
    pub user_id: i64,
    pub username: String,
    pub ip: String,
    pub created_at: i64,
    pub last_active: i64,
}
