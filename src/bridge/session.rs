//! The remote interactive shell session.
//!
//! Exactly one session exists at a time. It owns the russh channel:
//! the write half sits behind a mutex (single-writer discipline) and
//! the read half is consumed by one producer task that forwards every
//! drained chunk to the fan-out bus. There is no in-session reconnect;
//! when the transport fails the producer emits EOF, the bus tears the
//! session down, and the caller decides whether to reopen.
//!
//! The [`ShellTransport`] trait is the seam between the orchestrator
//! and the wire: production code uses [`RusshShell`], tests drive the
//! same paths with a scripted in-memory shell.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, client};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::AuthChain;
use super::bus::BusEvent;
use super::config::{BridgeConfig, MAX_RETRY_DELAY};
use super::error::{BridgeError, is_retryable_connect_error};
use super::types::SessionInfo;

/// Terminal type requested for the PTY.
const PTY_TERM: &str = "xterm-256color";

/// Default PTY geometry until a viewer resizes it.
const PTY_COLS: u32 = 120;
const PTY_ROWS: u32 = 40;

/// Ctrl-C.
const INTERRUPT_BYTE: u8 = 0x03;

/// Russh client handler that accepts all host keys.
///
/// This implementation accepts all server public keys without
/// verification, mirroring `StrictHostKeyChecking=no` in OpenSSH
/// configuration.
///
/// # Security Note
///
/// In production environments this should be extended to verify
/// against a known_hosts file to prevent man-in-the-middle attacks;
/// host key pinning belongs to the deployment, not the bridge core.
pub struct ShellClientHandler;

impl client::Handler for ShellClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Write-side operations on the remote shell.
///
/// This is the seam between the orchestrator and the wire.
/// Implementations must be thread-safe (`Send + Sync`) because the
/// orchestrator, the cancel path, the deadline watchdog, and the
/// viewer gateway all hold handles to the same transport. The
/// production implementation is [`RusshShell`]; tests substitute a
/// scripted in-memory shell to drive the same code paths without a
/// network.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    /// Write bytes into the shell's stdin.
    ///
    /// Used for dispatched commands (with the exit-capture marker
    /// appended) and for raw viewer keystrokes alike; the transport
    /// does not distinguish the two.
    ///
    /// # Errors
    ///
    /// Returns `transport_error` when the channel write fails; the
    /// session is considered lost and will be torn down by the pump
    /// once the producer observes EOF.
    async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Write the interrupt byte (Ctrl-C, `0x03`).
    ///
    /// Invoked by cancellation and by the per-command deadline. The
    /// shell decides what the interrupt means for the foreground
    /// process; the record's terminal state is committed separately at
    /// the next prompt boundary.
    async fn interrupt(&self) -> Result<(), BridgeError>;

    /// Propagate new PTY dimensions to the remote side.
    ///
    /// # Arguments
    ///
    /// * `cols` - Terminal width in character cells
    /// * `rows` - Terminal height in character cells
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError>;

    /// Tear the channel down.
    ///
    /// The read side observes EOF, which makes the producer emit a
    /// final [`BusEvent::Eof`] and the pump run its teardown (records
    /// interrupted, viewers notified and closed).
    async fn close(&self) -> Result<(), BridgeError>;
}

/// Production transport over a split russh channel.
///
/// The write half sits behind a mutex so that command dispatch,
/// viewer keystrokes, and interrupts serialise onto the wire; the
/// read half is owned exclusively by the producer task and never
/// contends with writers. The session handle is retained for the
/// graceful SSH-level disconnect at close.
pub struct RusshShell {
    writer: Mutex<russh::ChannelWriteHalf<client::Msg>>,
    handle: client::Handle<ShellClientHandler>,
}

#[async_trait]
impl ShellTransport for RusshShell {
    async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let writer = self.writer.lock().await;
        writer
            .data(bytes)
            .await
            .map_err(|e| BridgeError::Transport(format!("write failed: {}", e)))
    }

    async fn interrupt(&self) -> Result<(), BridgeError> {
        self.send(&[INTERRUPT_BYTE]).await
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        let writer = self.writer.lock().await;
        writer
            .window_change(cols, rows, 0, 0)
            .await
            .map_err(|e| BridgeError::Transport(format!("resize failed: {}", e)))
    }

    async fn close(&self) -> Result<(), BridgeError> {
        {
            let writer = self.writer.lock().await;
            let _ = writer.close().await;
        }
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await
        {
            warn!("error during disconnect: {}", e);
        }
        Ok(())
    }
}

/// Everything `open` hands back to the orchestrator.
pub struct OpenShell {
    pub transport: Arc<dyn ShellTransport>,
    pub info: SessionInfo,
    /// Drained shell output plus control events, consumed first by
    /// signature learning and then by the broadcast pump.
    pub events_rx: mpsc::UnboundedReceiver<BusEvent>,
    /// Control-side sender (force boundaries).
    pub events_tx: mpsc::UnboundedSender<BusEvent>,
    /// Stops the producer task.
    pub cancel: CancellationToken,
    pub retry_attempts: u32,
}

/// Parse an address string into host and port components.
///
/// Supports the following formats:
/// - `host:port` - Returns the specified host and port
/// - `host` - Returns the host with the default SSH port (22)
///
/// Uses `rsplit_once` so IPv6 forms like `[::1]:22` keep their
/// brackets intact.
///
/// # Arguments
///
/// * `address` - Address string in `host:port` or `host` format
///
/// # Returns
///
/// * `Ok((host, port))` - Parsed host string and port number
/// * `Err(_)` - `transport_error` if the port does not parse
///
/// # Examples
///
/// ```ignore
/// let (host, port) = parse_address("example.com:2222")?;
/// assert_eq!(host, "example.com");
/// assert_eq!(port, 2222);
///
/// let (host, port) = parse_address("192.168.1.1")?;
/// assert_eq!(port, 22); // Default port
/// ```
pub(crate) fn parse_address(address: &str) -> Result<(String, u16), BridgeError> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| BridgeError::Transport(format!("invalid port: {}", e)))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// Build the russh client configuration for the interactive session.
///
/// Creates an `Arc<client::Config>` with:
/// - No inactivity timeout: the shell stays open until explicitly
///   closed, however long the operator leaves it idle
/// - A keepalive at the given interval with at most 3 unanswered
///   keepalives before the connection is considered dead
///
/// # Arguments
///
/// * `keepalive` - Interval between keepalive probes
fn build_client_config(keepalive: Duration) -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(keepalive),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Establish one SSH connection and authenticate.
///
/// This is the core connection function that:
/// 1. Parses the address into host and port
/// 2. Builds the client configuration
/// 3. Connects with the given timeout
/// 4. Authenticates via an [`AuthChain`] built from the supplied
///    credentials (password, then key file, then SSH agent fallback)
///
/// Errors come back as plain strings so the retry wrapper can
/// classify them as transient or permanent.
async fn connect_once(
    address: &str,
    username: &str,
    password: Option<&str>,
    key_path: Option<&str>,
    connect_timeout: Duration,
    keepalive: Duration,
) -> Result<client::Handle<ShellClientHandler>, String> {
    let (host, port) = parse_address(address).map_err(|e| e.to_string())?;
    let config = build_client_config(keepalive);

    let connect_future = client::connect(config, (host.as_str(), port), ShellClientHandler);
    let mut handle = tokio::time::timeout(connect_timeout, connect_future)
        .await
        .map_err(|_| format!("Connection timed out after {:?}", connect_timeout))?
        .map_err(|e| format!("Failed to connect: {}", e))?;

    let chain = AuthChain::for_credentials(password, key_path);
    let success = chain.authenticate(&mut handle, username).await?;
    if !success {
        return Err("Authentication failed: no method succeeded".to_string());
    }

    Ok(handle)
}

/// Connect to SSH with retry logic using exponential backoff with
/// jitter.
///
/// Attempts to establish an SSH connection with automatic retries for
/// transient errors. Authentication failures are never retried, to
/// avoid locking accounts out.
///
/// # Arguments
///
/// * `address` - Server address in `host:port` or `host` format
/// * `username` - SSH username for authentication
/// * `password` - Optional password for password authentication
/// * `key_path` - Optional path to a private key file
/// * `connect_timeout` - Timeout for each connection attempt
/// * `config` - Bridge configuration (retry count, initial delay,
///   keepalive interval)
///
/// # Returns
///
/// * `Ok((handle, retry_count))` - Session handle and the number of
///   retries that were needed
/// * `Err(_)` - `transport_error` describing the final failure
///
/// # Retry Behavior
///
/// - Exponential backoff starting from `config.retry_delay`
/// - Maximum delay capped at [`MAX_RETRY_DELAY`]
/// - At most `config.max_retries` retries
/// - Random jitter added to prevent thundering herds
/// - Only transient connection errors are retried (see
///   [`is_retryable_connect_error`]); authentication and SSH protocol
///   failures abort immediately
pub(crate) async fn connect_with_retry(
    address: &str,
    username: &str,
    password: Option<&str>,
    key_path: Option<&str>,
    connect_timeout: Duration,
    config: &BridgeConfig,
) -> Result<(client::Handle<ShellClientHandler>, u32), BridgeError> {
    let attempts = std::sync::atomic::AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(config.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if attempt > 0 {
            warn!(
                "ssh connection retry attempt {} to {}@{}",
                attempt, username, address
            );
        }
        connect_once(
            address,
            username,
            password,
            key_path,
            connect_timeout,
            config.keepalive_interval,
        )
        .await
    })
    .retry(backoff)
    .when(|e: &String| is_retryable_connect_error(e))
    .notify(|err, dur| {
        warn!("ssh connection failed: {}. retrying in {:?}", err, dur);
    })
    .await;

    let total = attempts.load(std::sync::atomic::Ordering::SeqCst);
    let retry_count = total.saturating_sub(1);

    match result {
        Ok(handle) => Ok((handle, retry_count)),
        Err(e) => {
            error!(
                "ssh connection to {}@{} failed after {} attempt(s): {}",
                username, address, total, e
            );
            Err(BridgeError::Transport(format!(
                "connection failed after {} attempt(s): {}",
                total, e
            )))
        }
    }
}

/// Open the interactive shell session.
///
/// Connects with retry, authenticates, requests an
/// `xterm-256color` PTY (120x40 until a viewer resizes it), starts
/// the remote shell, splits the channel, and spawns the producer
/// task that forwards every drained chunk to the event stream.
///
/// # Arguments
///
/// * `address` - Server address in `host:port` or `host` format
/// * `username` - SSH username for authentication
/// * `password` - Optional password for password authentication
/// * `key_path` - Optional path to a private key file
/// * `connect_timeout` - Timeout for each connection attempt
/// * `config` - Bridge configuration (retry and keepalive settings)
///
/// # Returns
///
/// An [`OpenShell`] bundling the transport, the session metadata, the
/// event stream (consumed first by prompt-signature learning, then by
/// the broadcast pump), the control-side event sender, and the
/// cancellation token that stops the producer.
///
/// # Errors
///
/// `transport_error` if the connection, authentication, PTY request,
/// or shell request fails. No partial session is left behind: the
/// handle is dropped on error.
pub(crate) async fn open_shell(
    address: &str,
    username: &str,
    password: Option<&str>,
    key_path: Option<&str>,
    connect_timeout: Duration,
    config: &BridgeConfig,
) -> Result<OpenShell, BridgeError> {
    let (handle, retry_attempts) = connect_with_retry(
        address,
        username,
        password,
        key_path,
        connect_timeout,
        config,
    )
    .await?;

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| BridgeError::Transport(format!("failed to open channel: {}", e)))?;

    channel
        .request_pty(true, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &[])
        .await
        .map_err(|e| BridgeError::Transport(format!("pty request failed: {}", e)))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| BridgeError::Transport(format!("shell request failed: {}", e)))?;

    let (read_half, write_half) = channel.split();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    spawn_producer(read_half, events_tx.clone(), cancel.clone());

    let info = SessionInfo {
        session_id: uuid::Uuid::new_v4().to_string(),
        host: address.to_string(),
        username: username.to_string(),
        connected_at: chrono::Utc::now().to_rfc3339(),
    };

    info!(
        "opened interactive shell {} to {}@{} ({}x{} {})",
        info.session_id, username, address, PTY_COLS, PTY_ROWS, PTY_TERM
    );

    Ok(OpenShell {
        transport: Arc::new(RusshShell {
            writer: Mutex::new(write_half),
            handle,
        }),
        info,
        events_rx,
        events_tx,
        cancel,
        retry_attempts,
    })
}

/// Spawn the single producer task for the session.
///
/// The producer exclusively owns the channel read half and drains it
/// in a loop, forwarding every chunk as [`BusEvent::Data`] in exact
/// read order. PTY output is one merged stream (no stderr
/// separation); extended data is folded in for non-PTY edge cases.
///
/// On channel EOF/close, on cancellation, or when the receiving side
/// goes away, the task emits a final [`BusEvent::Eof`] so the
/// broadcast pump can run session teardown exactly once.
fn spawn_producer(
    mut read_half: russh::ChannelReadHalf,
    tx: mpsc::UnboundedSender<BusEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shell producer cancelled");
                    break;
                }

                msg = read_half.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if tx.send(BusEvent::Data(data.to_vec())).is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, .. }) => {
                            if tx.send(BusEvent::Data(data.to_vec())).is_err() {
                                break;
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            debug!("shell channel closed");
                            break;
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let _ = tx.send(BusEvent::Eof);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    mod address_parsing {
        use super::*;

        #[test]
        fn test_host_with_port() {
            let (host, port) = parse_address("example.com:2222").unwrap();
            assert_eq!(host, "example.com");
            assert_eq!(port, 2222);
        }

        #[test]
        fn test_default_port() {
            let (host, port) = parse_address("10.0.0.5").unwrap();
            assert_eq!(host, "10.0.0.5");
            assert_eq!(port, 22);
        }

        #[test]
        fn test_ipv6_keeps_brackets() {
            let (host, port) = parse_address("[::1]:22").unwrap();
            assert_eq!(host, "[::1]");
            assert_eq!(port, 22);
        }

        #[test]
        fn test_invalid_port_is_rejected() {
            assert!(parse_address("host:notaport").is_err());
            assert!(parse_address("host:99999").is_err());
        }
    }

    mod client_config {
        use super::*;

        #[test]
        fn test_interactive_session_has_no_inactivity_timeout() {
            let config = build_client_config(Duration::from_secs(30));
            assert_eq!(config.inactivity_timeout, None);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }
    }
}
