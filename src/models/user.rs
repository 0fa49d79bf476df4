//! Minimal user record referenced by challenges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub username: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Username, falling back to the local part of the email.
    pub fn display_name(&self) -> String {
        match &self.username {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .email
                .split('@')
                .next()
                .unwrap_or(&self.email)
                .to_string(),
        }
    }
}
