//! Defaults applied to every socket of a [`SocketSystem`](crate::SocketSystem).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wait applied to blocking operations when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Length of the pending connection queue when nothing else is configured.
pub const DEFAULT_BACKLOG: u32 = 5;

/// Initial options of newly created sockets.
///
/// Every option can be changed per socket afterwards. Missing fields deserialize to their
/// defaults, the timeout is expressed in milliseconds:
///
/// ```
/// let config: evsock::SocketConfig = serde_json::from_str(r#"{ "timeout_ms": 250 }"#).unwrap();
/// assert_eq!(config.timeout, std::time::Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// Fail with [`SocketError::WouldBlock`](crate::SocketError::WouldBlock) instead of waiting.
    pub non_blocking: bool,

    /// How long blocking operations wait before failing with
    /// [`SocketError::TimedOut`](crate::SocketError::TimedOut).
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,

    /// Set `SO_REUSEADDR` before binding.
    pub reusable: bool,

    /// Allow datagram sockets to send to broadcast addresses.
    pub broadcast: bool,

    /// Length of the pending connection queue of listening sockets.
    pub backlog: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            non_blocking: false,
            timeout: DEFAULT_TIMEOUT,
            reusable: false,
            broadcast: false,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::SocketConfig;

    #[test]
    fn empty_object_is_default() {
        let config: SocketConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SocketConfig::default());
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.backlog, 5);
    }

    #[test]
    fn serializes_timeout_as_millis() {
        let config = SocketConfig {
            non_blocking: true,
            timeout: Duration::from_millis(1500),
            ..SocketConfig::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "non_blocking": true,
                "timeout_ms": 1500,
                "reusable": false,
                "broadcast": false,
                "backlog": 5,
            })
        );
        assert_eq!(serde_json::from_value::<SocketConfig>(json).unwrap(), config);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<SocketConfig>(r#"{ "timeout": 3 }"#).is_err());
    }
}
