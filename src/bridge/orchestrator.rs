//! The command orchestrator: the bridge's public surface.
//!
//! Composes the shell session, the command registry, the fan-out bus,
//! and the output filter behind the operations the agent sees:
//! `execute`, `status`, `fetch_raw`, `cancel`, `list`, plus session
//! connect/disconnect and the viewer relay.
//!
//! Dispatch discipline: one command at a time. `execute` claims the
//! in-flight slot (failing fast with `busy`), writes the command plus
//! the exit-capture marker, and waits synchronously up to the caller's
//! timeout. If the wait elapses the command keeps running and stays
//! retrievable by id; a separate watchdog enforces the hard
//! per-command deadline with an interrupt and, failing a prompt within
//! the force grace, a forced boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::ansi;
use super::bus::{BusEvent, FanoutBus, PumpContext, run_pump};
use super::config::BridgeConfig;
use super::error::BridgeError;
use super::filter::{ExitMarker, FilterRequest, FilteredPayload, OutputFilter, OutputMode};
use super::prompt::PromptDetector;
use super::record::{CommandEntry, CommandStatus, InFlightSlot, wait_for_terminal};
use super::registry::CommandRegistry;
use super::session::{ShellTransport, open_shell};
use super::types::{
    BufferInfo, CancelCommandResponse, CommandListItem, CommandOutputResponse,
    CommandStatusResponse, ConnectResponse, ExecuteCommandResponse, ListCommandsResponse,
    SessionInfo, TerminalStatusResponse,
};

/// Upper bound on signature learning at connect time.
const LEARN_DEADLINE: Duration = Duration::from_secs(10);

/// Quiet interval that ends a signature-learning read burst.
const LEARN_QUIET: Duration = Duration::from_millis(300);

/// Cloneable handles onto the one live session.
#[derive(Clone)]
struct ActiveSession {
    info: SessionInfo,
    transport: Arc<dyn ShellTransport>,
    slot: Arc<InFlightSlot>,
    control_tx: mpsc::UnboundedSender<BusEvent>,
    connected_rx: watch::Receiver<bool>,
    marker: ExitMarker,
    cancel: CancellationToken,
    prompt_signature: String,
}

/// The bridge's public command API.
///
/// One orchestrator owns the registry, the fan-out bus, the filter,
/// and the at-most-one live session. Agent tool handlers, the viewer
/// gateway, and background tasks all share it behind an `Arc`; every
/// method takes `&self` and synchronises through the in-flight slot
/// mutex and the per-command status watch channels.
pub struct Orchestrator {
    config: BridgeConfig,
    filter: OutputFilter,
    registry: Arc<CommandRegistry>,
    bus: Arc<FanoutBus>,
    session: Mutex<Option<ActiveSession>>,
}

impl Orchestrator {
    /// Build an orchestrator with no session; sizes the registry and
    /// the viewer queues from the configuration.
    pub fn new(config: BridgeConfig) -> Self {
        let registry = Arc::new(CommandRegistry::new(
            config.max_history,
            config.buffer_max_bytes,
        ));
        let bus = Arc::new(FanoutBus::new(
            config.viewer_queue_capacity,
            config.viewer_lag_limit,
        ));
        let filter = OutputFilter::new(config.thresholds, config.truncation);
        Self {
            config,
            filter,
            registry,
            bus,
            session: Mutex::new(None),
        }
    }

    /// The fan-out bus, for viewer registration by the gateway.
    pub fn bus(&self) -> Arc<FanoutBus> {
        self.bus.clone()
    }

    /// Open the remote shell session.
    ///
    /// Connects over SSH (with retry for transient failures), learns
    /// the prompt signature by echoing a salted probe and waiting for
    /// quiescence, then installs the session and starts the broadcast
    /// pump. An existing session is torn down first, so connecting
    /// twice never leaks a shell.
    ///
    /// # Arguments
    ///
    /// * `address` - Server address as `host` or `host:port`
    /// * `username` - SSH username
    /// * `password` - Optional password credential
    /// * `key_path` - Optional private key file path
    /// * `timeout_secs` - Per-attempt connect timeout override
    ///
    /// # Returns
    ///
    /// A [`ConnectResponse`] with the session id, the number of
    /// retries that were needed, and the learned prompt signature.
    ///
    /// # Errors
    ///
    /// `transport_error` when the connection, authentication, PTY
    /// setup, or signature learning fails.
    pub async fn connect(
        &self,
        address: &str,
        username: &str,
        password: Option<&str>,
        key_path: Option<&str>,
        timeout_secs: Option<u64>,
    ) -> Result<ConnectResponse, BridgeError> {
        self.disconnect_inner().await;

        let connect_timeout = self.config.resolve_connect_timeout(timeout_secs);
        let mut shell = open_shell(
            address,
            username,
            password,
            key_path,
            connect_timeout,
            &self.config,
        )
        .await?;

        let signature =
            learn_prompt_signature(&mut shell.events_rx, &shell.transport, &self.bus).await?;
        info!("learned prompt signature: {:?}", signature);

        let marker = ExitMarker::new();
        let info = shell.info.clone();
        let retry_attempts = shell.retry_attempts;
        self.install_session(
            shell.transport,
            shell.info,
            shell.events_rx,
            shell.events_tx,
            shell.cancel,
            signature.clone(),
            marker,
        )
        .await;

        Ok(ConnectResponse {
            session_id: info.session_id,
            host: info.host.clone(),
            username: info.username.clone(),
            authenticated: true,
            retry_attempts,
            prompt_signature: signature,
            message: format!(
                "Connected to {}@{}; one interactive shell is shared by the agent and all viewers",
                info.username, info.host
            ),
        })
    }

    /// Wire up a session from parts and spawn its broadcast pump.
    ///
    /// Split out of [`Orchestrator::connect`] so tests can drive the
    /// whole execute/cancel/teardown surface through an in-memory
    /// transport without a real SSH server. The pump task owns the
    /// prompt detector; the stored [`ActiveSession`] holds the
    /// cloneable handles every other path needs.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn install_session(
        &self,
        transport: Arc<dyn ShellTransport>,
        info: SessionInfo,
        events_rx: mpsc::UnboundedReceiver<BusEvent>,
        events_tx: mpsc::UnboundedSender<BusEvent>,
        cancel: CancellationToken,
        prompt_signature: String,
        marker: ExitMarker,
    ) {
        let slot = Arc::new(InFlightSlot::new());
        let (connected_tx, connected_rx) = watch::channel(true);

        let mut detector = PromptDetector::new();
        detector.set_signature(prompt_signature.clone());

        let ctx = PumpContext {
            bus: self.bus.clone(),
            registry: self.registry.clone(),
            slot: slot.clone(),
            detector,
            grace: self.config.prompt_grace,
            marker: marker.clone(),
            connected_tx,
        };
        tokio::spawn(run_pump(events_rx, ctx));

        self.bus.broadcast_status(true).await;

        let mut session = self.session.lock().await;
        *session = Some(ActiveSession {
            info,
            transport,
            slot,
            control_tx: events_tx,
            connected_rx,
            marker,
            cancel,
            prompt_signature,
        });
    }

    /// Close the session if one is open.
    ///
    /// Cancels the producer and closes the transport; the pump then
    /// observes EOF and runs the teardown: pending and running
    /// commands transition to `interrupted`, viewers receive a
    /// disconnected status frame and are closed.
    ///
    /// # Returns
    ///
    /// * `Ok(message)` - a human-readable confirmation
    /// * `Err(_)` - `not_connected` when no session was open
    pub async fn disconnect(&self) -> Result<String, BridgeError> {
        match self.disconnect_inner().await {
            Some(info) => Ok(format!(
                "Disconnected from {}@{}",
                info.username, info.host
            )),
            None => Err(BridgeError::NotConnected),
        }
    }

    async fn disconnect_inner(&self) -> Option<SessionInfo> {
        let session = self.session.lock().await.take()?;
        info!("closing session to {}@{}", session.info.username, session.info.host);
        session.cancel.cancel();
        if let Err(e) = session.transport.close().await {
            warn!("transport close: {}", e);
        }
        // The producer observes the closed channel and emits EOF; the
        // pump then interrupts in-flight commands and closes viewers.
        Some(session.info)
    }

    async fn active(&self) -> Result<ActiveSession, BridgeError> {
        let session = self.session.lock().await;
        let active = session.as_ref().ok_or(BridgeError::NotConnected)?;
        if !*active.connected_rx.borrow() {
            return Err(BridgeError::NotConnected);
        }
        Ok(active.clone())
    }

    pub async fn is_connected(&self) -> bool {
        self.active().await.is_ok()
    }

    /// Dispatch a command on the shared shell.
    ///
    /// Claims the in-flight slot (exactly one command runs at a
    /// time), writes the command followed by the exit-capture marker,
    /// and waits synchronously up to `timeout_secs` for the prompt
    /// boundary. On wait expiry the command is NOT cancelled: it
    /// keeps running in the background, stays retrievable by id, and
    /// the response reports `running`.
    ///
    /// Commands ending in `&` are dispatched without the marker (a
    /// `; echo` suffix after `&` would be a shell syntax error); the
    /// prompt returns immediately and no exit code is captured.
    ///
    /// # Arguments
    ///
    /// * `command` - Shell command text, written verbatim plus marker
    /// * `timeout_secs` - Synchronous wait window (default from
    ///   config, capped at the per-command maximum)
    /// * `mode` - Output mode for the payload when the command
    ///   finishes inside the wait window
    /// * `conversation_id` - Optional conversation tag stored on the
    ///   record
    ///
    /// # Returns
    ///
    /// An [`ExecuteCommandResponse`]. When the boundary arrived in
    /// time, `status` is terminal and `output`/`exit_code`/
    /// `has_errors` are populated through the filter; otherwise
    /// `status` is `running` with a polling hint in `message`.
    ///
    /// # Errors
    ///
    /// * `not_connected` - no open session
    /// * `busy` - another command occupies the in-flight slot; the
    ///   message carries its id and nothing is written to the shell
    /// * `transport_error` - the write failed; the record is marked
    ///   `interrupted`
    ///
    /// # Deadline Behavior
    ///
    /// Independent of the synchronous wait, a watchdog enforces the
    /// configured hard per-command deadline: on expiry it sends the
    /// interrupt, re-aims the record at `timeout`, and forces the
    /// boundary if no prompt follows within the force grace.
    pub async fn execute(
        &self,
        command: &str,
        timeout_secs: Option<u64>,
        mode: OutputMode,
        conversation_id: Option<String>,
    ) -> Result<ExecuteCommandResponse, BridgeError> {
        let session = self.active().await?;
        let command_id = Uuid::new_v4().to_string();

        session.slot.try_claim(&command_id).await?;

        let entry = match self.registry.create(
            command_id.clone(),
            command.to_string(),
            conversation_id,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                session.slot.take_if(&command_id).await;
                return Err(e);
            }
        };

        // Backgrounded commands return the prompt immediately; the
        // trailing marker would be a shell syntax error after `&`.
        let trimmed = command.trim_end();
        let is_background = trimmed.ends_with('&') && !trimmed.ends_with("&&");
        let wire = if is_background {
            format!("{}\n", command)
        } else {
            format!("{}{}\n", command, session.marker.command_suffix())
        };

        entry.transition(CommandStatus::Running).await?;
        if let Err(e) = session.transport.send(wire.as_bytes()).await {
            session.slot.take_if(&command_id).await;
            let _ = entry.transition(CommandStatus::Interrupted).await;
            return Err(e);
        }

        info!("dispatched command {}: {}", command_id, command);
        self.spawn_watchdog(session.clone(), entry.clone());

        let wait = self.config.resolve_wait_timeout(timeout_secs);
        let mut status_rx = entry.watch_status();
        match tokio::time::timeout(wait, wait_for_terminal(&mut status_rx)).await {
            Ok(status) => {
                let payload = self.render(&entry, mode, &session).await;
                Ok(ExecuteCommandResponse {
                    command_id,
                    status,
                    output: Some(payload.text),
                    exit_code: payload.exit_code,
                    has_errors: Some(payload.has_errors),
                    duration_secs: entry.duration_secs().await,
                    buffer_info: self.buffer_info(&entry, payload.line_count).await,
                    message: None,
                })
            }
            Err(_) => Ok(ExecuteCommandResponse {
                command_id: command_id.clone(),
                status: CommandStatus::Running,
                output: None,
                exit_code: None,
                has_errors: None,
                duration_secs: entry.duration_secs().await,
                buffer_info: self.buffer_info(&entry, 0).await,
                message: Some(format!(
                    "Command still running; poll with check_command_status(\"{}\")",
                    command_id
                )),
            }),
        }
    }

    /// Spawn the per-command deadline watchdog.
    ///
    /// Deadlines are monotonic (`tokio::time::Instant`), set at
    /// dispatch, and unaffected by wall-clock drift. The watchdog
    /// waits for either the terminal state or the deadline; on expiry
    /// it re-aims the in-flight slot at `timeout`, sends the
    /// interrupt, and - if the prompt still has not come back after
    /// the force grace - asks the pump to force the boundary, which
    /// marks the record `boundary_forced`.
    fn spawn_watchdog(&self, session: ActiveSession, entry: Arc<CommandEntry>) {
        let max_timeout = self.config.max_timeout;
        let force_grace = self.config.force_grace;

        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + max_timeout;
            let mut status_rx = entry.watch_status();

            let deadline_hit = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => true,
                _ = wait_for_terminal(&mut status_rx) => false,
            };
            if !deadline_hit {
                return;
            }

            let command_id = entry.info.command_id.clone();
            if session
                .slot
                .set_intended(&command_id, CommandStatus::Timeout)
                .await
            {
                warn!("command {} hit its deadline; interrupting", command_id);
                let _ = session.transport.interrupt().await;

                tokio::time::sleep(force_grace).await;
                if !entry.status().is_terminal() {
                    let _ = session.control_tx.send(BusEvent::ForceBoundary { command_id });
                }
            }
        });
    }

    /// Snapshot of a command by id.
    ///
    /// Running commands report status and progress metadata only;
    /// once the record is terminal the response carries a payload
    /// rendered through the output filter in the requested mode.
    /// Calling this also triggers pull-based eviction of old terminal
    /// records beyond the retention cap.
    ///
    /// # Arguments
    ///
    /// * `command_id` - Id returned by [`Orchestrator::execute`]
    /// * `mode` - Output mode for the payload of terminal records
    ///
    /// # Errors
    ///
    /// `unknown_command_id` when the id names no retained record
    /// (never issued, or already evicted).
    pub async fn status(
        &self,
        command_id: &str,
        mode: OutputMode,
    ) -> Result<CommandStatusResponse, BridgeError> {
        self.registry.evict();
        let entry = self
            .registry
            .get(command_id)
            .ok_or_else(|| BridgeError::UnknownCommandId(command_id.to_string()))?;

        let status = entry.status();
        if !status.is_terminal() {
            return Ok(CommandStatusResponse {
                command_id: command_id.to_string(),
                status,
                output: None,
                exit_code: None,
                has_errors: None,
                completed_at: None,
                duration_secs: entry.duration_secs().await,
                buffer_info: self.buffer_info(&entry, 0).await,
            });
        }

        let session = self.session.lock().await.clone();
        let payload = self.render_with(&entry, mode, session.as_ref()).await;
        Ok(CommandStatusResponse {
            command_id: command_id.to_string(),
            status,
            output: Some(payload.text),
            exit_code: payload.exit_code,
            has_errors: Some(payload.has_errors),
            completed_at: entry.completed_at.lock().await.clone(),
            duration_secs: entry.duration_secs().await,
            buffer_info: self.buffer_info(&entry, payload.line_count).await,
        })
    }

    /// Retrieve a command's retained output.
    ///
    /// # Arguments
    ///
    /// * `command_id` - Id of the command
    /// * `raw` - When true, the buffer comes back strictly as
    ///   retained (exit marker included, the middle possibly elided
    ///   for very large outputs); when false, terminal control
    ///   sequences are stripped and newlines normalised first
    ///
    /// # Errors
    ///
    /// `unknown_command_id` when the id names no retained record.
    pub async fn fetch_output(
        &self,
        command_id: &str,
        raw: bool,
    ) -> Result<CommandOutputResponse, BridgeError> {
        let entry = self
            .registry
            .get(command_id)
            .ok_or_else(|| BridgeError::UnknownCommandId(command_id.to_string()))?;

        let snapshot = {
            let buffer = entry.buffer.lock().await;
            String::from_utf8_lossy(&buffer.snapshot()).into_owned()
        };
        let output = if raw { snapshot } else { ansi::clean(&snapshot) };
        let line_count = output.lines().count();

        Ok(CommandOutputResponse {
            command_id: command_id.to_string(),
            output,
            buffer_info: self.buffer_info(&entry, line_count).await,
        })
    }

    /// Cancel a command by interrupting the shell.
    ///
    /// If `command_id` is the in-flight command, the interrupt byte
    /// is written and the record is re-aimed at `cancelled`; the
    /// actual transition still waits for the next prompt boundary so
    /// the buffer stays consistent when it freezes. Anything else -
    /// a finished command, or an id displaced from the slot - is a
    /// no-op reported as `not_running`, and calling cancel twice is
    /// harmless.
    ///
    /// # Arguments
    ///
    /// * `command_id` - Id of the command to cancel
    ///
    /// # Returns
    ///
    /// A [`CancelCommandResponse`] with `cancelled: true` when the
    /// interrupt was sent, `cancelled: false` / `not_running`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// * `unknown_command_id` - the id names no retained record
    /// * `not_connected` - the record is live but the session is gone
    /// * `transport_error` - writing the interrupt byte failed
    pub async fn cancel(&self, command_id: &str) -> Result<CancelCommandResponse, BridgeError> {
        let entry = self
            .registry
            .get(command_id)
            .ok_or_else(|| BridgeError::UnknownCommandId(command_id.to_string()))?;

        if entry.status().is_terminal() {
            return Ok(CancelCommandResponse {
                command_id: command_id.to_string(),
                cancelled: false,
                message: "not_running".to_string(),
            });
        }

        let session = self.active().await?;
        if !session
            .slot
            .set_intended(command_id, CommandStatus::Cancelled)
            .await
        {
            return Ok(CancelCommandResponse {
                command_id: command_id.to_string(),
                cancelled: false,
                message: "not_running".to_string(),
            });
        }

        session.transport.interrupt().await?;
        info!("sent interrupt for command {}", command_id);

        Ok(CancelCommandResponse {
            command_id: command_id.to_string(),
            cancelled: true,
            message: "Interrupt sent; the record finalises at the next prompt".to_string(),
        })
    }

    /// List tracked commands, newest first.
    ///
    /// Triggers pull-based eviction before reading, so the listing
    /// never exceeds the retention cap plus whatever is still in
    /// flight.
    ///
    /// # Arguments
    ///
    /// * `status_filter` - Only records currently in this status
    /// * `limit` - Cap on the number of records returned
    pub async fn list(
        &self,
        status_filter: Option<CommandStatus>,
        limit: Option<usize>,
    ) -> ListCommandsResponse {
        self.registry.evict();
        let commands: Vec<CommandListItem> = self
            .registry
            .list(status_filter, limit)
            .into_iter()
            .map(|s| CommandListItem {
                command_id: s.info.command_id,
                command: s.info.command,
                status: s.status,
                created_at: s.info.created_at,
            })
            .collect();
        let count = commands.len();
        ListCommandsResponse { commands, count }
    }

    /// Connectivity snapshot: whether a session is open, to whom, and
    /// how many viewers are attached. Never fails; a missing or lost
    /// session reports `connected: false`.
    pub async fn terminal_status(&self) -> TerminalStatusResponse {
        let viewer_count = self.bus.viewer_count().await;
        match self.active().await {
            Ok(session) => TerminalStatusResponse {
                connected: true,
                host: Some(session.info.host),
                username: Some(session.info.username),
                viewer_count,
            },
            Err(_) => TerminalStatusResponse {
                connected: false,
                host: None,
                username: None,
                viewer_count,
            },
        }
    }

    /// Relay viewer keystrokes into the shell.
    ///
    /// The bytes are written straight to the transport: they are
    /// never attributed to a command's buffer and never fed to
    /// boundary detection on the input side, even while a command is
    /// running. Whatever the shell echoes back is ordinary output and
    /// flows through the fan-out like any other byte.
    ///
    /// # Errors
    ///
    /// `not_connected` when no session is open, `transport_error`
    /// when the write fails.
    pub async fn viewer_input(&self, data: &str) -> Result<(), BridgeError> {
        let session = self.active().await?;
        session.transport.send(data.as_bytes()).await
    }

    /// Propagate a viewer's terminal resize to the PTY.
    ///
    /// All viewers share the one PTY, so the most recent resize from
    /// any of them wins.
    ///
    /// # Errors
    ///
    /// `not_connected` when no session is open, `transport_error`
    /// when the window-change request fails.
    pub async fn viewer_resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        let session = self.active().await?;
        session.transport.resize(cols, rows).await
    }

    async fn render(&self, entry: &CommandEntry, mode: OutputMode, session: &ActiveSession) -> FilteredPayload {
        self.render_with(entry, mode, Some(session)).await
    }

    async fn render_with(
        &self,
        entry: &CommandEntry,
        mode: OutputMode,
        session: Option<&ActiveSession>,
    ) -> FilteredPayload {
        let raw = {
            let buffer = entry.buffer.lock().await;
            String::from_utf8_lossy(&buffer.snapshot()).into_owned()
        };
        let exit_code = *entry.exit_code.lock().await;
        let duration_secs = entry.duration_secs().await;

        self.filter.render(&FilterRequest {
            command_id: &entry.info.command_id,
            command: &entry.info.command,
            raw: &raw,
            mode,
            status: entry.status(),
            exit_code,
            duration_secs,
            marker: session.map(|s| &s.marker),
            prompt: session.map(|s| s.prompt_signature.as_str()),
        })
    }

    async fn buffer_info(&self, entry: &CommandEntry, line_count: usize) -> BufferInfo {
        let buffer = entry.buffer.lock().await;
        BufferInfo {
            line_count,
            total_bytes: buffer.total_bytes(),
            truncated: buffer.is_truncated(),
        }
    }
}

/// Learn the prompt signature at session start.
///
/// Echoes a salted probe token and collects output until the stream
/// stays quiet for a full read window after the probe's result line
/// has appeared; the last non-empty cleaned line of the idle terminal
/// is then the prompt signature the detector will match against. The
/// salt keeps login banners from being mistaken for the probe, and
/// the final `signature != probe_token` check keeps a slow shell from
/// handing back the probe's own echo.
///
/// Banner bytes drained here are still fanned out to any viewers
/// attached this early, preserving the every-byte-to-every-viewer
/// contract.
///
/// # Arguments
///
/// * `events` - The session event stream, exclusively held until the
///   pump takes over
/// * `transport` - Write side, for sending the probe
/// * `bus` - Fan-out bus for the banner bytes
///
/// # Returns
///
/// The learned signature string.
///
/// # Errors
///
/// `transport_error` if the shell closes mid-learning or the overall
/// learning deadline expires without a usable signature.
async fn learn_prompt_signature(
    events: &mut mpsc::UnboundedReceiver<BusEvent>,
    transport: &Arc<dyn ShellTransport>,
    bus: &FanoutBus,
) -> Result<String, BridgeError> {
    let probe_salt = uuid::Uuid::new_v4().simple().to_string();
    let probe_token = format!("__TB_SIG_{}__", &probe_salt[..8]);

    transport
        .send(format!("echo {}\n", probe_token).as_bytes())
        .await?;

    let deadline = tokio::time::Instant::now() + LEARN_DEADLINE;
    let mut collected = String::new();

    loop {
        match tokio::time::timeout(LEARN_QUIET, events.recv()).await {
            Ok(Some(BusEvent::Data(bytes))) => {
                bus.broadcast_chunk(&bytes).await;
                collected.push_str(&String::from_utf8_lossy(&bytes));
            }
            Ok(Some(BusEvent::Eof)) | Ok(None) => {
                return Err(BridgeError::Transport(
                    "shell closed during prompt learning".to_string(),
                ));
            }
            Ok(Some(BusEvent::ForceBoundary { .. })) => {}
            Err(_) => {
                // Quiet for a full window: the probe result and the
                // fresh prompt should both be on screen.
                let cleaned = ansi::clean(&collected);
                let probe_answered = cleaned.lines().any(|l| l.trim() == probe_token);
                if probe_answered
                    && let Some(signature) = PromptDetector::learn_from(&cleaned)
                    && signature != probe_token
                {
                    return Ok(signature);
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(BridgeError::Transport(
                        "prompt signature learning timed out".to_string(),
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    const SIG: &str = "op@box:~$";

    /// In-memory transport: records writes, scripts nothing. Tests
    /// drive shell output by pushing events themselves.
    struct ScriptedShell {
        sent: StdMutex<Vec<Vec<u8>>>,
        events_tx: mpsc::UnboundedSender<BusEvent>,
    }

    impl ScriptedShell {
        fn sent_text(&self) -> String {
            let sent = self.sent.lock().unwrap();
            sent.iter()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl ShellTransport for ScriptedShell {
        async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }

        async fn interrupt(&self) -> Result<(), BridgeError> {
            self.send(&[0x03]).await
        }

        async fn resize(&self, _cols: u32, _rows: u32) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), BridgeError> {
            let _ = self.events_tx.send(BusEvent::Eof);
            Ok(())
        }
    }

    struct Rig {
        orchestrator: Arc<Orchestrator>,
        shell: Arc<ScriptedShell>,
        events_tx: mpsc::UnboundedSender<BusEvent>,
    }

    async fn rig() -> Rig {
        rig_with(BridgeConfig {
            prompt_grace: Duration::from_millis(20),
            force_grace: Duration::from_millis(50),
            ..BridgeConfig::default()
        })
        .await
    }

    async fn rig_with(config: BridgeConfig) -> Rig {
        let orchestrator = Arc::new(Orchestrator::new(config));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shell = Arc::new(ScriptedShell {
            sent: StdMutex::new(Vec::new()),
            events_tx: events_tx.clone(),
        });

        orchestrator
            .install_session(
                shell.clone(),
                SessionInfo {
                    session_id: "s1".into(),
                    host: "box:22".into(),
                    username: "op".into(),
                    connected_at: chrono::Utc::now().to_rfc3339(),
                },
                events_rx,
                events_tx.clone(),
                CancellationToken::new(),
                SIG.to_string(),
                ExitMarker::with_salt("t1"),
            )
            .await;

        Rig {
            orchestrator,
            shell,
            events_tx,
        }
    }

    /// The shell returning to its prompt: marker result then prompt.
    fn prompt_return(exit_code: i32) -> Vec<u8> {
        format!("__RTX_t1__:{}__END__\n{} ", exit_code, SIG).into_bytes()
    }

    impl Rig {
        fn push(&self, bytes: &[u8]) {
            self.events_tx.send(BusEvent::Data(bytes.to_vec())).unwrap();
        }
    }

    mod execute_flow {
        use super::*;

        #[tokio::test]
        async fn test_execute_completes_at_boundary() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();

            let exec = tokio::spawn(async move {
                orch.execute("echo hi", Some(5), OutputMode::Auto, None).await
            });

            // Echo + output + marker + prompt.
            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(b"echo hi; echo __RTX_t1__:$?__END__\r\nhi\r\n");
            rig.push(&prompt_return(0));

            let response = exec.await.unwrap().unwrap();
            assert_eq!(response.status, CommandStatus::Completed);
            assert_eq!(response.exit_code, Some(0));
            assert_eq!(response.has_errors, Some(false));
            assert_eq!(response.output.as_deref(), Some("hi"));
            assert!(response.duration_secs.is_some());

            // The wire carried the command plus the marker suffix.
            let sent = rig.shell.sent_text();
            assert!(sent.contains("echo hi; echo __RTX_t1__:$?__END__\n"));
        }

        #[tokio::test]
        async fn test_execute_returns_running_after_wait_window() {
            let rig = rig().await;

            let response = rig
                .orchestrator
                .execute("sleep 60", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            assert_eq!(response.status, CommandStatus::Running);
            assert!(response.output.is_none());
            assert!(response.message.as_deref().unwrap().contains("check_command_status"));

            // Not cancelled: no interrupt byte was written.
            assert!(!rig.shell.sent_text().contains('\u{3}'));
        }

        #[tokio::test]
        async fn test_second_execute_is_busy_and_writes_nothing() {
            let rig = rig().await;
            let first = rig
                .orchestrator
                .execute("sleep 10", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            let before = rig.shell.sent_text();
            let err = rig
                .orchestrator
                .execute("whoami", Some(1), OutputMode::Auto, None)
                .await
                .unwrap_err();

            match err {
                BridgeError::Busy(current) => assert_eq!(current, first.command_id),
                other => panic!("expected busy, got {:?}", other),
            }
            // No bytes for whoami reached the shell.
            assert_eq!(rig.shell.sent_text(), before);
        }

        #[tokio::test]
        async fn test_background_command_gets_no_marker() {
            let rig = rig().await;
            let _ = rig
                .orchestrator
                .execute("long_job.sh &", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            let sent = rig.shell.sent_text();
            assert!(sent.contains("long_job.sh &\n"));
            assert!(!sent.contains("__RTX_"));
        }

        #[tokio::test]
        async fn test_execute_without_session_is_not_connected() {
            let orchestrator = Orchestrator::new(BridgeConfig::default());
            let err = orchestrator
                .execute("ls", None, OutputMode::Auto, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "not_connected");
        }
    }

    mod status_and_output {
        use super::*;

        #[tokio::test]
        async fn test_status_of_terminal_command_carries_payload() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("cat /nope", Some(5), OutputMode::Auto, None).await
            });

            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(b"cat: /nope: No such file or directory\r\n");
            rig.push(&prompt_return(1));

            let executed = exec.await.unwrap().unwrap();
            assert_eq!(executed.status, CommandStatus::Completed);
            assert_eq!(executed.has_errors, Some(true));
            assert_eq!(executed.exit_code, Some(1));
            assert!(
                executed
                    .output
                    .as_deref()
                    .unwrap()
                    .contains("No such file or directory")
            );

            let status = rig
                .orchestrator
                .status(&executed.command_id, OutputMode::Auto)
                .await
                .unwrap();
            assert_eq!(status.status, CommandStatus::Completed);
            assert!(status.completed_at.is_some());
            assert_eq!(status.has_errors, Some(true));
        }

        #[tokio::test]
        async fn test_raw_status_equals_fetch_raw() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("seq 3", Some(5), OutputMode::Auto, None).await
            });

            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(b"1\r\n2\r\n3\r\n");
            rig.push(&prompt_return(0));
            let executed = exec.await.unwrap().unwrap();

            let via_status = rig
                .orchestrator
                .status(&executed.command_id, OutputMode::Raw)
                .await
                .unwrap();
            let via_fetch = rig
                .orchestrator
                .fetch_output(&executed.command_id, true)
                .await
                .unwrap();

            assert_eq!(via_status.output.unwrap(), via_fetch.output);
        }

        #[tokio::test]
        async fn test_unknown_id_errors() {
            let rig = rig().await;
            assert_eq!(
                rig.orchestrator
                    .status("nope", OutputMode::Auto)
                    .await
                    .unwrap_err()
                    .kind(),
                "unknown_command_id"
            );
            assert_eq!(
                rig.orchestrator
                    .fetch_output("nope", true)
                    .await
                    .unwrap_err()
                    .kind(),
                "unknown_command_id"
            );
        }

        #[tokio::test]
        async fn test_list_reports_recent_first() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("echo one", Some(5), OutputMode::Auto, None).await
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(&prompt_return(0));
            let first = exec.await.unwrap().unwrap();

            let listed = rig.orchestrator.list(None, None).await;
            assert_eq!(listed.count, 1);
            assert_eq!(listed.commands[0].command_id, first.command_id);

            let running_only = rig
                .orchestrator
                .list(Some(CommandStatus::Running), None)
                .await;
            assert_eq!(running_only.count, 0);
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_cancel_interrupts_and_finalises_at_boundary() {
            let rig = rig().await;
            let started = rig
                .orchestrator
                .execute("sleep 60", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();
            assert_eq!(started.status, CommandStatus::Running);

            let cancel = rig.orchestrator.cancel(&started.command_id).await.unwrap();
            assert!(cancel.cancelled);
            assert!(rig.shell.sent_text().contains('\u{3}'));

            // The shell acknowledges with ^C and a fresh prompt.
            rig.push(b"^C\r\n");
            rig.push(&prompt_return(130));

            let entry = rig.orchestrator.registry.get(&started.command_id).unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Cancelled);
            assert_eq!(*entry.exit_code.lock().await, Some(130));
        }

        #[tokio::test]
        async fn test_cancel_terminal_command_is_noop() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("true", Some(5), OutputMode::Auto, None).await
            });
            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(&prompt_return(0));
            let done = exec.await.unwrap().unwrap();

            let before = rig.shell.sent_text();
            let cancel = rig.orchestrator.cancel(&done.command_id).await.unwrap();
            assert!(!cancel.cancelled);
            assert_eq!(cancel.message, "not_running");
            // Idempotent: no interrupt written.
            assert_eq!(rig.shell.sent_text(), before);
        }
    }

    mod deadline {
        use super::*;

        #[tokio::test]
        async fn test_deadline_interrupts_then_forces_boundary() {
            let rig = rig_with(BridgeConfig {
                max_timeout: Duration::from_millis(80),
                force_grace: Duration::from_millis(60),
                prompt_grace: Duration::from_millis(20),
                ..BridgeConfig::default()
            })
            .await;

            let started = rig
                .orchestrator
                .execute("spin forever", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            let entry = rig.orchestrator.registry.get(&started.command_id).unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(2),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();

            assert_eq!(status, CommandStatus::Timeout);
            assert!(entry.was_boundary_forced());
            assert!(rig.shell.sent_text().contains('\u{3}'));
        }

        #[tokio::test]
        async fn test_deadline_respects_prompt_within_force_grace() {
            let rig = rig_with(BridgeConfig {
                max_timeout: Duration::from_millis(80),
                force_grace: Duration::from_millis(200),
                prompt_grace: Duration::from_millis(20),
                ..BridgeConfig::default()
            })
            .await;

            let started = rig
                .orchestrator
                .execute("slowish", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            // After the interrupt, the shell returns a prompt inside
            // the force grace: a natural timeout boundary.
            tokio::time::sleep(Duration::from_millis(120)).await;
            rig.push(b"^C\r\n");
            rig.push(&prompt_return(130));

            let entry = rig.orchestrator.registry.get(&started.command_id).unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(2),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Timeout);
            assert!(!entry.was_boundary_forced());
        }
    }

    mod session_loss {
        use super::*;

        #[tokio::test]
        async fn test_session_loss_interrupts_running_command() {
            let rig = rig().await;
            let started = rig
                .orchestrator
                .execute("sleep 60", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            rig.push(b"some partial output\r\n");
            rig.events_tx.send(BusEvent::Eof).unwrap();

            let entry = rig.orchestrator.registry.get(&started.command_id).unwrap();
            let mut status_rx = entry.watch_status();
            let status = tokio::time::timeout(
                Duration::from_secs(1),
                wait_for_terminal(&mut status_rx),
            )
            .await
            .unwrap();
            assert_eq!(status, CommandStatus::Interrupted);

            // Let the pump finish its teardown (viewer close, flag flip).
            tokio::time::sleep(Duration::from_millis(30)).await;

            // The accumulated output survives.
            let raw = rig
                .orchestrator
                .fetch_output(&started.command_id, true)
                .await
                .unwrap();
            assert!(raw.output.contains("partial output"));

            // Subsequent executes report no session.
            let err = rig
                .orchestrator
                .execute("ls", None, OutputMode::Auto, None)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "not_connected");

            let status = rig.orchestrator.terminal_status().await;
            assert!(!status.connected);
        }
    }

    mod scenarios {
        use super::*;

        #[tokio::test]
        async fn test_install_collapses_to_summary() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("apt-get install -y nginx", Some(10), OutputMode::Auto, None)
                    .await
            });

            tokio::time::sleep(Duration::from_millis(30)).await;
            let mut body = String::new();
            for i in 0..15_000 {
                if i % 100 == 0 {
                    body.push_str(&format!("Setting up pkg-{} (1.0) ...\r\n", i / 100));
                } else {
                    body.push_str(&format!("Get:{} http://mirror row\r\n", i));
                }
            }
            rig.push(body.as_bytes());
            rig.push(&prompt_return(0));

            let response = exec.await.unwrap().unwrap();
            assert_eq!(response.status, CommandStatus::Completed);
            assert_eq!(response.exit_code, Some(0));
            assert_eq!(response.has_errors, Some(false));

            let output = response.output.unwrap();
            assert!(output.lines().count() <= 40, "summary should be compact");
            assert!(output.contains("packages set up: 150"));
        }

        #[tokio::test]
        async fn test_command_with_no_output_completes_cleanly() {
            let rig = rig().await;
            let orch = rig.orchestrator.clone();
            let exec = tokio::spawn(async move {
                orch.execute("true", Some(5), OutputMode::Auto, None).await
            });

            // Only the marker result and the prompt come back.
            tokio::time::sleep(Duration::from_millis(30)).await;
            rig.push(&prompt_return(0));

            let response = exec.await.unwrap().unwrap();
            assert_eq!(response.status, CommandStatus::Completed);
            assert_eq!(response.exit_code, Some(0));
            assert_eq!(response.output.as_deref(), Some(""));
            assert_eq!(response.has_errors, Some(false));
        }

        #[tokio::test]
        async fn test_viewer_input_is_never_attributed() {
            let rig = rig().await;
            let started = rig
                .orchestrator
                .execute("sleep 60", Some(0), OutputMode::Auto, None)
                .await
                .unwrap();

            rig.orchestrator.viewer_input("y\n").await.unwrap();
            assert!(rig.shell.sent_text().ends_with("y\n"));

            // The keystroke itself lands in no buffer; only what the
            // shell echoes back does.
            let raw = rig
                .orchestrator
                .fetch_output(&started.command_id, true)
                .await
                .unwrap();
            assert_eq!(raw.output, "");
        }
    }
}
