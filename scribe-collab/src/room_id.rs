//! Composite room identifier `{sessionId}-{filePath}`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

const UUID_LEN: usize = 36;

/// Names one collaborative document: a file inside an editing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId {
    session_id: String,
    file_path: String,
}

impl RoomId {
    pub fn new(session_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            file_path: file_path.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    /// Parse a wire room name.
    ///
    /// Session ids are usually UUIDs, which contain dashes themselves, so a
    /// leading 36-character UUID followed by `-` is taken as the session.
    /// Otherwise the name is split at its first `-`. Both halves must be
    /// non-empty.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidRoomId(raw.to_string());

        let (session, path) = match raw.get(..UUID_LEN) {
            Some(prefix)
                if uuid::Uuid::try_parse(prefix).is_ok()
                    && raw.as_bytes().get(UUID_LEN) == Some(&b'-') =>
            {
                (prefix, &raw[UUID_LEN + 1..])
            }
            _ => raw.split_once('-').ok_or_else(invalid)?,
        };

        if session.is_empty() || path.is_empty() {
            return Err(invalid());
        }
        Ok(Self::new(session, path))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.session_id, self.file_path)
    }
}

impl FromStr for RoomId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
