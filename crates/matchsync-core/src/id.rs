//! Identity types for MatchSync
//!
//! User ids are opaque strings handed out by the transport. Only the user id
//! is used as a peer's identity; session id and username ride along for
//! display and logging.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Peer identity, stable for the lifetime of a match
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    #[inline]
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        UserId(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        UserId(id)
    }
}

/// One connected peer, as reported by the transport
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: UserId,
    pub session_id: String,
    pub username: String,
}

impl Presence {
    pub fn new(user_id: impl Into<UserId>, session_id: impl Into<String>, username: impl Into<String>) -> Self {
        Presence {
            user_id: user_id.into(),
            session_id: session_id.into(),
            username: username.into(),
        }
    }

    /// Presence with session id and username derived from the user id
    pub fn from_user(user_id: impl Into<UserId>) -> Self {
        let user_id = user_id.into();
        Presence {
            session_id: format!("session-{}", user_id),
            username: user_id.to_string(),
            user_id,
        }
    }
}
