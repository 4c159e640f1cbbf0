//! Access-control collaborator consulted before a connection joins a room.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Permission on a session's files. Ordered: `Read < Write < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessLevel {
    Read,
    Write,
    Owner,
}

impl AccessLevel {
    pub fn can_write(&self) -> bool {
        *self >= AccessLevel::Write
    }
}

pub trait AccessControl: Send + Sync + 'static {
    /// Highest level `user` holds on `session_id`, if any.
    fn access_level(&self, session_id: &str, user: &str) -> Option<AccessLevel>;

    fn check_access(&self, session_id: &str, user: &str, required: AccessLevel) -> bool {
        self.access_level(session_id, user)
            .is_some_and(|level| level >= required)
    }
}

/// Grants everyone owner access. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn access_level(&self, _session_id: &str, _user: &str) -> Option<AccessLevel> {
        Some(AccessLevel::Owner)
    }
}

/// Explicit per-session grants held in memory.
#[derive(Debug, Default)]
pub struct StaticAccessList {
    grants: RwLock<HashMap<(String, String), AccessLevel>>,
}

impl StaticAccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, session_id: &str, user: &str, level: AccessLevel) {
        self.grants
            .write()
            .insert((session_id.to_string(), user.to_string()), level);
    }

    pub fn revoke(&self, session_id: &str, user: &str) -> bool {
        self.grants
            .write()
            .remove(&(session_id.to_string(), user.to_string()))
            .is_some()
    }
}

impl AccessControl for StaticAccessList {
    fn access_level(&self, session_id: &str, user: &str) -> Option<AccessLevel> {
        self.grants
            .read()
            .get(&(session_id.to_string(), user.to_string()))
            .copied()
    }
}
