//! Single-session acceptance check against a freshly launched server.

use std::{
    fmt,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    task::JoinHandle,
};

use crate::{
    config::ValidateConfig,
    error::{Error, Result},
    schema::{self, Payload},
    session::Session,
};

pub const SUCCESS_MESSAGE: &str = "Verification Successful";

/// What a passing run saw.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationSummary {
    pub snapshot_seen: bool,
    pub event_batches: usize,
    pub events: usize,
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SUCCESS_MESSAGE} (snapshot received, {} event batches, {} events)",
            self.event_batches, self.events
        )
    }
}

/// Reads from `session` until a snapshot and `min_event_batches` event
/// batches have arrived or the peer closes, checking every event on the way.
pub async fn verify_stream(
    session: &mut Session,
    min_event_batches: usize,
    recv_timeout: Duration,
) -> Result<ValidationSummary> {
    let mut summary = ValidationSummary::default();

    tracing::info!("waiting for messages");
    while !summary.snapshot_seen || summary.event_batches < min_event_batches {
        let Some(msg) = session.receive_timeout(recv_timeout).await? else {
            tracing::info!("connection closed by server");
            break;
        };
        let Some(text) = msg.as_str() else {
            tracing::debug!(len = msg.len(), "ignoring binary message");
            continue;
        };

        match Payload::parse(text)? {
            Payload::Snapshot(map) => {
                let blocks = map
                    .get("blocks")
                    .and_then(|b| b.as_array())
                    .map_or(0, Vec::len);
                tracing::info!(blocks, "received snapshot");
                summary.snapshot_seen = true;
            }
            Payload::EventBatch(events) => {
                tracing::info!(events = events.len(), "received event batch");
                schema::validate_batch(&events)?;
                summary.event_batches += 1;
                summary.events += events.len();
            }
            Payload::Other(value) => {
                let keys: Vec<&str> = value
                    .as_object()
                    .map(|o| o.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                tracing::warn!(?keys, "received unknown payload");
            }
        }
    }

    if !summary.snapshot_seen {
        return Err(Error::MissingSnapshot);
    }
    Ok(summary)
}

/// Connects (with retries) to the configured target and verifies the stream.
/// The session is closed on every path.
pub async fn verify_target(config: &ValidateConfig) -> Result<ValidationSummary> {
    let mut session =
        Session::connect_with_retry(&config.target, config.session.clone(), config.retry).await?;
    tracing::info!(url = %config.target, "connected to WebSocket server");

    let result = verify_stream(&mut session, config.min_event_batches, config.recv_timeout).await;
    session.close().await;
    result
}

/// Captured output of a terminated server.
#[derive(Debug, Default)]
pub struct ServerOutput {
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for ServerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Server Stdout ---")?;
        writeln!(f, "{}", self.stdout)?;
        writeln!(f, "--- Server Stderr ---")?;
        write!(f, "{}", self.stderr)
    }
}

/// A server child process whose stdout and stderr are drained in the
/// background so it never stalls on a full pipe.
pub struct ServerProcess {
    child: Child,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl ServerProcess {
    pub fn spawn(path: &Path, args: &[String]) -> Result<Self> {
        let binary_error = |reason: String| Error::ServerBinary {
            path: path.display().to_string(),
            reason,
        };
        if !path.exists() {
            return Err(binary_error("not found".into()));
        }

        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| binary_error(e.to_string()))?;
        tracing::info!(path = %path.display(), pid = ?child.id(), "started server");

        Ok(Self {
            stdout: child.stdout.take().map(drain),
            stderr: child.stderr.take().map(drain),
            child,
        })
    }

    /// Kills the server and collects what it printed, waiting at most
    /// `grace` for each step.
    pub async fn terminate(mut self, grace: Duration) -> ServerOutput {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "server already exited");
        }
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to reap server");
                None
            }
            Err(_) => {
                tracing::warn!(?grace, "server did not exit in time");
                None
            }
        };

        ServerOutput {
            status,
            stdout: collect(self.stdout.take(), grace).await,
            stderr: collect(self.stderr.take(), grace).await,
        }
    }
}

fn drain<R: AsyncRead + Unpin + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::debug!(error = %e, "server pipe read failed");
        }
        buf
    })
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>, grace: Duration) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

/// Outcome of a full acceptance run.
#[derive(Debug)]
pub struct ValidationRun {
    pub result: Result<ValidationSummary>,
    /// `None` when the server could not be started.
    pub server_output: Option<ServerOutput>,
}

impl ValidationRun {
    #[must_use]
    pub fn exit_code(&self) -> u8 { u8::from(self.result.is_err()) }
}

/// Launches the server, verifies its stream, then terminates it whether or
/// not verification passed.
pub async fn run(config: &ValidateConfig) -> ValidationRun {
    let server = match ServerProcess::spawn(&config.server_bin, &config.server_args) {
        Ok(server) => server,
        Err(e) => {
            return ValidationRun {
                result: Err(e),
                server_output: None,
            };
        }
    };

    let result = verify_target(config).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, kind = ?e.kind(), "validation failed");
    }

    let output = server.terminate(config.shutdown_grace).await;
    ValidationRun {
        result,
        server_output: Some(output),
    }
}
