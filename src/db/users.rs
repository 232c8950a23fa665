//! User onboarding records.

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::meeting::{user_hash_key, NewUser, User};

pub struct UserRepository;

const USER_COLUMNS: &str = "id, email, hash_key, name, company, role, onboarded_at";

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        hash_key: row.get(2)?,
        name: row.get(3)?,
        company: row.get(4)?,
        role: row.get(5)?,
        onboarded_at: row.get(6)?,
    })
}

impl UserRepository {
    /// Onboard a user. Onboarding an address twice returns the original record
    /// unchanged.
    pub fn onboard(conn: &Connection, user: &NewUser) -> Result<User> {
        let email = user.email.trim();
        if email.is_empty() || !email.contains('@') {
            bail!("Invalid email address: {:?}", user.email);
        }

        let hash_key = user_hash_key(email);

        conn.execute(
            "INSERT INTO users (email, hash_key, name, company, role) VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(hash_key) DO NOTHING",
            params![email, hash_key, user.name, user.company, user.role],
        )
        .context("Failed to insert user")?;

        Self::get_by_hash_key(conn, &hash_key)?
            .with_context(|| format!("User {} missing after onboarding", email))
    }

    pub fn get_by_hash_key(conn: &Connection, hash_key: &str) -> Result<Option<User>> {
        conn.query_row(
            &format!("SELECT {} FROM users WHERE hash_key = ?1", USER_COLUMNS),
            params![hash_key],
            map_user,
        )
        .optional()
        .context("Failed to query user")
    }

    pub fn get_by_email(conn: &Connection, email: &str) -> Result<Option<User>> {
        Self::get_by_hash_key(conn, &user_hash_key(email))
    }
}
