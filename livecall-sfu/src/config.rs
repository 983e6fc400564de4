//! Session timing configuration

use livecall_core::config::RtcConfig;
use std::time::Duration;

/// Timers shared by every Pusher and Puller on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Period of the keyframe request loop on connected Pushers
    pub keyframe_interval: Duration,
    /// Period of per-track stat sampling
    pub stat_interval: Duration,
    /// How long a cross-node play waits for the owning node
    pub subscribe_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&RtcConfig::default())
    }
}

impl From<&RtcConfig> for SessionConfig {
    fn from(config: &RtcConfig) -> Self {
        Self {
            keyframe_interval: Duration::from_millis(config.keyframe_interval_ms.max(1)),
            stat_interval: Duration::from_millis(config.stat_interval_ms.max(1)),
            subscribe_timeout: config.subscribe_timeout(),
        }
    }
}
