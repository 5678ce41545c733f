/// Configuration management
use crate::error::{ChatError, Result};
use crate::realtime::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws";

/// Client configuration for the backend and realtime channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// REST base URL (history, send, reports)
    pub api_url: String,

    /// WebSocket endpoint for the realtime channel
    pub ws_url: String,

    /// Per-request timeout for REST calls, send included
    pub request_timeout: Duration,

    /// Channel handshake timeout
    pub connect_timeout: Duration,

    /// Buffered session events per subscriber before it lags
    pub event_capacity: usize,

    /// Automatic channel reconnect. Off unless set.
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            request_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            event_capacity: 256,
            reconnect: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments.
    ///
    /// Only the flags below are consumed; positional arguments and other
    /// flags are left for the caller.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut config = Self::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    config.api_url = flag_value(args, i, "--api-url")?.to_string();
                    i += 2;
                }
                "--ws-url" => {
                    config.ws_url = flag_value(args, i, "--ws-url")?.to_string();
                    i += 2;
                }
                "--request-timeout-ms" => {
                    config.request_timeout = parse_millis(flag_value(args, i, "--request-timeout-ms")?)?;
                    i += 2;
                }
                "--connect-timeout-ms" => {
                    config.connect_timeout = parse_millis(flag_value(args, i, "--connect-timeout-ms")?)?;
                    i += 2;
                }
                "--event-capacity" => {
                    let raw = flag_value(args, i, "--event-capacity")?;
                    config.event_capacity = raw.parse::<usize>().map_err(|_| {
                        ChatError::Config("--event-capacity must be a positive number".to_string())
                    })?;
                    i += 2;
                }
                "--reconnect" => {
                    config.reconnect = Some(ReconnectPolicy::default());
                    i += 1;
                }
                _ => {
                    i += 1;
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Env overrides (nice for scripts)
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CARECHAT_API_URL") {
            self.api_url = url;
        }
        if let Ok(url) = std::env::var("CARECHAT_WS_URL") {
            self.ws_url = url;
        }
        if std::env::var("CARECHAT_RECONNECT").is_ok() && self.reconnect.is_none() {
            self.reconnect = Some(ReconnectPolicy::default());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ChatError::Config(format!(
                "api url must be http(s)://, got '{}'",
                self.api_url
            )));
        }
        if !(self.ws_url.starts_with("ws://") || self.ws_url.starts_with("wss://")) {
            return Err(ChatError::Config(format!(
                "ws url must be ws(s)://, got '{}'",
                self.ws_url
            )));
        }
        if self.event_capacity == 0 {
            return Err(ChatError::Config("event capacity must be at least 1".to_string()));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(ChatError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(|s| s.as_str())
        .ok_or_else(|| ChatError::Config(format!("{} requires a value", flag)))
}

fn parse_millis(raw: &str) -> Result<Duration> {
    raw.parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| ChatError::Config(format!("'{}' is not a number of milliseconds", raw)))
}
