use std::time::Duration;

use anyhow::{bail, Context, Result};
use url::Url;

pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(10);
pub const DEFAULT_BATCH_MAX: usize = 10;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the session bootstrap keeps polling for an unconfirmed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationTimeout {
    /// Poll until the session is confirmed or the client shuts down.
    WaitForever,
    /// Abandon the pending session after the given duration.
    GiveUpAfter(Duration),
}

/// Knobs for the persistent streaming connection.
#[derive(Debug, Clone, Copy)]
pub struct StreamingTuning {
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub handshake_timeout: Duration,
}

impl Default for StreamingTuning {
    fn default() -> Self {
        Self {
            reconnect_initial_delay: DEFAULT_RECONNECT_INITIAL_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The http(s) GraphQL endpoint. Queries and mutations post here.
    pub endpoint: String,
    /// Whether this context can hold a persistent connection. When false,
    /// subscriptions fail with an explicit error rather than degrading.
    pub streaming: bool,
    pub batch_window: Duration,
    pub batch_max: usize,
    pub poll_interval: Duration,
    pub confirmation_timeout: ConfirmationTimeout,
    pub streaming_tuning: StreamingTuning,
    /// Human-readable description attached to login sessions so the
    /// confirming side can tell clients apart.
    pub login_description: String,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let parsed = Url::parse(&endpoint).context("invalid graphql endpoint")?;
        match parsed.scheme() {
            "http" | "https" => {}
            other => bail!("unsupported graphql endpoint scheme: {other}"),
        }
        Ok(Self {
            endpoint,
            streaming: true,
            batch_window: DEFAULT_BATCH_WINDOW,
            batch_max: DEFAULT_BATCH_MAX,
            poll_interval: DEFAULT_POLL_INTERVAL,
            confirmation_timeout: ConfirmationTimeout::WaitForever,
            streaming_tuning: StreamingTuning::default(),
            login_description: default_login_description(),
        })
    }

    /// The ws(s) endpoint derived from the http(s) one. Infallible because
    /// `new` already validated the scheme.
    pub fn ws_endpoint(&self) -> String {
        if self.endpoint.starts_with("https://") {
            self.endpoint.replacen("https://", "wss://", 1)
        } else {
            self.endpoint.replacen("http://", "ws://", 1)
        }
    }
}

/// Default session description, in the role of a browser user agent string.
pub fn default_login_description() -> String {
    format!(
        "{}/{} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https_endpoints() {
        assert!(ClientConfig::new("http://127.0.0.1:5000/graphql").is_ok());
        assert!(ClientConfig::new("https://example.com/graphql").is_ok());
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(ClientConfig::new("ftp://example.com/graphql").is_err());
        assert!(ClientConfig::new("not a url").is_err());
    }

    #[test]
    fn derives_the_ws_endpoint_from_the_http_one() {
        let config = ClientConfig::new("http://127.0.0.1:5000/graphql").expect("config");
        assert_eq!(config.ws_endpoint(), "ws://127.0.0.1:5000/graphql");

        let config = ClientConfig::new("https://example.com/graphql").expect("config");
        assert_eq!(config.ws_endpoint(), "wss://example.com/graphql");
    }
}
