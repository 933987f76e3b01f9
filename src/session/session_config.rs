use std::time::Duration;

use anyhow::bail;

use crate::protocol::op_code::OpCode;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub socket_url: String,
    pub project_id: String,
    pub project_token: String,

    /// Send frames as UTF-8 bytes instead of text. The server is told about this through a
    ///  query parameter on the socket URL.
    pub use_binary: bool,

    /// Interval for re-opening the transport while no connection is confirmed. An attempt that
    ///  has not received any frame within this interval is abandoned.
    pub reconnect_interval: Duration,
    /// The connection is considered dead if no frame arrives for this long
    pub liveness_timeout: Duration,
    /// Minimum time between two housekeeping passes. Housekeeping is triggered by received
    ///  frames, so on a silent connection it does not run at all.
    pub housekeeping_interval: Duration,
    /// Requests waiting for a reply longer than this are failed with a timeout
    pub reply_timeout: Duration,

    /// number of retransmission requests for a missed frame before it is given up
    pub max_retransmission_attempts: u32,
    /// A sequence number or liveness count that skips more frames than this is treated as a
    ///  protocol error, and the frame is dropped
    pub max_sequence_gap: u64,

    /// Operations without a callback are removed after transmission if their op code is below
    ///  this threshold. Operations at or above it are kept and re-sent after every reconnect.
    pub persistent_op_threshold: OpCode,

    pub event_channel_capacity: usize,
}

impl SessionConfig {
    pub const BINARY_URL_SUFFIX: &'static str = "?en=etf";

    pub fn new(socket_url: impl Into<String>, project_id: impl Into<String>, project_token: impl Into<String>) -> SessionConfig {
        SessionConfig {
            socket_url: socket_url.into(),
            project_id: project_id.into(),
            project_token: project_token.into(),
            use_binary: false,
            reconnect_interval: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(120),
            housekeeping_interval: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(30),
            max_retransmission_attempts: 3,
            max_sequence_gap: 10_000,
            persistent_op_threshold: OpCode::SetDefaultConfig,
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.socket_url.is_empty() {
            bail!("socket URL must not be empty");
        }
        if self.reconnect_interval.is_zero() {
            bail!("reconnect interval must be positive");
        }
        if self.liveness_timeout.is_zero() {
            bail!("liveness timeout must be positive");
        }
        if self.max_retransmission_attempts == 0 {
            bail!("at least one retransmission attempt is required");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }

    pub fn effective_url(&self) -> String {
        if self.use_binary {
            format!("{}{}", self.socket_url, Self::BINARY_URL_SUFFIX)
        }
        else {
            self.socket_url.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::text(false, "wss://example.net/socket")]
    #[case::binary(true, "wss://example.net/socket?en=etf")]
    fn test_effective_url(#[case] use_binary: bool, #[case] expected: &str) {
        let mut config = SessionConfig::new("wss://example.net/socket", "p1", "t1");
        config.use_binary = use_binary;
        assert_eq!(config.effective_url(), expected);
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionConfig::new("wss://example.net/socket", "p1", "t1").validate().is_ok());
    }

    #[rstest]
    #[case::empty_url(|c: &mut SessionConfig| c.socket_url.clear())]
    #[case::zero_reconnect(|c: &mut SessionConfig| c.reconnect_interval = Duration::ZERO)]
    #[case::zero_liveness(|c: &mut SessionConfig| c.liveness_timeout = Duration::ZERO)]
    #[case::no_retries(|c: &mut SessionConfig| c.max_retransmission_attempts = 0)]
    #[case::no_channel(|c: &mut SessionConfig| c.event_channel_capacity = 0)]
    fn test_validate_rejects(#[case] tweak: fn(&mut SessionConfig)) {
        let mut config = SessionConfig::new("wss://example.net/socket", "p1", "t1");
        tweak(&mut config);
        assert!(config.validate().is_err());
    }
}
