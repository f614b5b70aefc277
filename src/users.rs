//! Credential store.
//!
//! `UserStore` is the seam between the request parser's login/register
//! flow and whatever holds the accounts. The in-memory implementation
//! backs the binary and the tests; a database-backed store would plug in
//! behind the same trait.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info};

/// Failure talking to the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store cannot be reached.
    Unavailable,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable => write!(f, "credential store unavailable"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Account lookup and creation.
pub trait UserStore: Send + Sync {
    /// Check credentials. A login compares against the stored password;
    /// a registration claims the username and persists the pair when it
    /// is free.
    fn verify(&self, username: &str, password: &str, is_login: bool) -> Result<bool, StoreError>;
}

/// Accounts held in process memory.
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, String>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-populate accounts.
    #[cfg(test)]
    pub fn with_users(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().collect()),
        }
    }
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStore for MemoryUserStore {
    fn verify(&self, username: &str, password: &str, is_login: bool) -> Result<bool, StoreError> {
        if is_login {
            let users = self.users.read().unwrap();
            let ok = users.get(username).map(String::as_str) == Some(password);
            if !ok {
                debug!(username, "login rejected");
            }
            Ok(ok)
        } else {
            let mut users = self.users.write().unwrap();
            if users.contains_key(username) {
                debug!(username, "username already taken");
                return Ok(false);
            }
            users.insert(username.to_string(), password.to_string());
            info!(username, "account registered");
            Ok(true)
        }
    }
}
