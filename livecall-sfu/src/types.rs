//! Common types used throughout the session layer

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a Pusher or Puller; only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Negotiating,
    Connected,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of a publish request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub answer: String,
    pub stream_key: String,
}

/// Result of a play request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Played {
    pub answer: String,
    pub subscriber_key: String,
}
