use std::{fmt, path::PathBuf, time::Duration};

use url::Url;

use crate::{
    MAX_FRAME_PAYLOAD, MAX_MESSAGE_SIZE,
    error::{Error, Result},
};

/// Where a session connects: host, port and request path of a `ws://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".into(),
        }
    }

    /// Parses a `ws://host[:port][/path]` URL. `wss://` is refused since the
    /// client does not speak TLS.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
        match parsed.scheme() {
            "ws" => {}
            "wss" => return Err(invalid("TLS (wss://) is not supported")),
            _ => return Err(invalid("expected a ws:// URL")),
        }
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(q) = parsed.query() {
            path.push('?');
            path.push_str(q);
        }

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            path,
        })
    }

    /// Value for the `Host` header and for `TcpStream::connect`.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws://{}{}", self.authority(), self.path)
    }
}

/// Per-connection limits and behaviour.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_frame_size: usize,
    pub max_message_size: usize,
    /// Answer Ping with Pong.
    pub reply_to_pings: bool,
    pub read_buffer_size: usize,
    /// Bound on TCP connect plus the upgrade exchange.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_PAYLOAD,
            max_message_size: MAX_MESSAGE_SIZE,
            reply_to_pings: true,
            read_buffer_size: 32 * 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection attempts made while a server may still be starting up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn once() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 20,
            delay: Duration::from_millis(100),
        }
    }
}

pub const DEFAULT_SERVER_BIN: &str = "./build-asan/server_sim";
pub const DEFAULT_PORT: u16 = 9999;

#[derive(Debug, Clone)]
pub struct ValidateConfig {
    pub server_bin: PathBuf,
    pub server_args: Vec<String>,
    pub target: Target,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    /// Event batches to see (after the snapshot) before declaring success.
    pub min_event_batches: usize,
    /// Longest wait for any single message.
    pub recv_timeout: Duration,
    /// Time allowed for the server to exit and flush its output.
    pub shutdown_grace: Duration,
}

impl ValidateConfig {
    /// Server flags used for the acceptance run: slow event interval so the
    /// client cannot miss the stream.
    #[must_use]
    pub fn default_server_args(port: u16) -> Vec<String> {
        [
            "--server",
            "--port",
            port.to_string().as_str(),
            "--requests",
            "1000",
            "--interval-us",
            "10000",
            "--no-progress",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            server_bin: PathBuf::from(DEFAULT_SERVER_BIN),
            server_args: Self::default_server_args(DEFAULT_PORT),
            target: Target::new("localhost", DEFAULT_PORT),
            retry: RetryPolicy::default(),
            session: SessionConfig::default(),
            min_event_batches: 5,
            recv_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub target: Target,
    pub clients: usize,
    pub duration: Duration,
    /// How long a session waits for a message before rechecking the stop
    /// signal.
    pub poll_interval: Duration,
    /// Extra time after `duration` before stuck sessions are abandoned.
    pub stop_grace: Duration,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            target: Target::new("localhost", DEFAULT_PORT),
            clients: 10,
            duration: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
            retry: RetryPolicy::once(),
            session: SessionConfig::default(),
        }
    }
}
