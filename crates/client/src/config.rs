use std::time::Duration;

/// Client tuning. The defaults are the values the widget ships with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server origin, e.g. `https://chat.example.com`.
    pub base_url: String,
    /// Reported to the server's version gate.
    pub widget_version: Option<String>,
    /// A push transport that is not open by then is abandoned.
    pub connect_timeout: Duration,
    /// A socket closing sooner than this after opening is a structural failure.
    pub quick_failure_window: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub poll_interval: Duration,
    pub poll_max_delay: Duration,
    /// Consecutive poll failures before polling is disabled.
    pub max_poll_failures: u32,
    /// Non-visitor messages with equal content this close together are one message.
    pub dedup_tolerance: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3001".to_string(),
            widget_version: None,
            connect_timeout: Duration::from_secs(5),
            quick_failure_window: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            poll_interval: Duration::from_secs(3),
            poll_max_delay: Duration::from_secs(30),
            max_poll_failures: 10,
            dedup_tolerance: Duration::from_millis(2000),
        }
    }
}
