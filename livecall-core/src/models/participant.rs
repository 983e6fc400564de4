use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Participant role; serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Role {
    /// Receives only
    Audience = 1,
    /// Publishes at least one media track
    Broadcast = 2,
}

impl TryFrom<i32> for Role {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        match code {
            1 => Ok(Self::Audience),
            2 => Ok(Self::Broadcast),
            other => Err(Error::InvalidInput(format!("unknown role {other}"))),
        }
    }
}

impl From<Role> for i32 {
    fn from(role: Role) -> Self {
        role as Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub u_id: i64,
    pub role: Role,
    /// Milliseconds since epoch, taken when the pusher connected
    pub join_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
}

impl Participant {
    #[must_use]
    pub fn new(u_id: i64, role: Role, join_time: i64, stream_key: impl Into<String>) -> Self {
        let stream_key = stream_key.into();
        Self {
            u_id,
            role,
            join_time,
            stream_key: (!stream_key.is_empty()).then_some(stream_key),
        }
    }
}
