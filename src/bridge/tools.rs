//! MCP tool surface for the terminal bridge.
//!
//! - `terminal_connect`: open the single remote shell session
//! - `terminal_disconnect`: close it
//! - `get_terminal_status`: connectivity and viewer count
//! - `execute_command`: dispatch a command with completion detection
//! - `check_command_status`: poll a command by id
//! - `get_command_output`: full or raw retained output
//! - `cancel_command`: interrupt the in-flight command
//! - `list_commands`: recent command records
//!
//! Every handler is a thin façade over [`Orchestrator`]; errors are
//! serialised as `{kind, message}` payload strings.

use std::sync::Arc;

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::{error, info};

use super::error::BridgeError;
use super::filter::OutputMode;
use super::orchestrator::Orchestrator;
use super::record::CommandStatus;
use super::types::{
    CancelCommandResponse, CommandOutputResponse, CommandStatusResponse, ConnectResponse,
    ExecuteCommandResponse, ListCommandsResponse, TerminalStatusResponse,
};

/// Agent-facing tools over the shared terminal session.
pub struct TerminalTools {
    pub orchestrator: Arc<Orchestrator>,
}

fn agent_err(err: BridgeError) -> String {
    if matches!(err, BridgeError::InvalidStateTransition { .. }) {
        error!("programming fault surfaced at tool boundary: {}", err);
        debug_assert!(false, "invalid state transition reached the tool layer");
    }
    err.to_payload()
}

fn parse_mode(output_mode: Option<String>) -> Result<OutputMode, String> {
    match output_mode {
        None => Ok(OutputMode::Auto),
        Some(raw) => OutputMode::parse(&raw).ok_or_else(|| {
            agent_err(BridgeError::Server(format!(
                "unknown output_mode {:?}; expected auto|full|preview|summary|minimal|raw",
                raw
            )))
        }),
    }
}

#[Tools]
impl TerminalTools {
    /// Connect to the remote machine and open the shared interactive
    /// shell.
    ///
    /// Exactly one session is active at a time; connecting while a
    /// session exists closes the old one first (its running commands
    /// transition to `interrupted`). The shell is shared by the agent
    /// and every attached browser viewer - all of them see the same
    /// byte stream, and viewer keystrokes land in the same shell.
    ///
    /// **Authentication:** password and key_path are tried in that
    /// order; with neither supplied, the SSH agent is used. Transient
    /// network failures are retried with backoff; bad credentials
    /// fail immediately.
    ///
    /// **Returned values to note:**
    /// - `session_id`: identifies this shell session
    /// - `prompt_signature`: the learned shell prompt used for
    ///   command-completion detection
    /// - `retry_attempts`: how many reconnect attempts were needed
    async fn terminal_connect(
        &self,
        /// Server address as "host" or "host:port" (default port 22)
        address: String,
        /// SSH username
        username: String,
        /// Password for password authentication (optional if using a key or agent)
        password: Option<String>,
        /// Path to a private key file (optional)
        key_path: Option<String>,
        /// Connection timeout in seconds (default: 30, env: TERMBRIDGE_CONNECT_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<ConnectResponse>, String> {
        info!("connect requested for {}@{}", username, address);
        self.orchestrator
            .connect(
                &address,
                &username,
                password.as_deref(),
                key_path.as_deref(),
                timeout_secs,
            )
            .await
            .map(StructuredContent)
            .map_err(agent_err)
    }

    /// Close the remote session and release the shell.
    ///
    /// **Important:** any pending or running commands transition to
    /// `interrupted` (their accumulated output stays retrievable by
    /// id), and every attached viewer receives a disconnected status
    /// frame and is closed. Check `list_commands` first if you need
    /// to preserve running operations.
    async fn terminal_disconnect(&self) -> Result<Text<String>, String> {
        self.orchestrator
            .disconnect()
            .await
            .map(Text)
            .map_err(agent_err)
    }

    /// Report whether a session is open, and for whom.
    ///
    /// Also reports how many browser viewers are currently attached
    /// to the shared terminal. Use this before `execute_command` when
    /// unsure whether `terminal_connect` has been called.
    async fn get_terminal_status(&self) -> StructuredContent<TerminalStatusResponse> {
        StructuredContent(self.orchestrator.terminal_status().await)
    }

    /// Execute a command on the remote shell with smart completion
    /// detection.
    ///
    /// Waits synchronously up to `timeout` seconds for the shell
    /// prompt to return, then replies with filtered output. If the
    /// wait elapses the command is NOT cancelled: it keeps running in
    /// the background and the response carries `status: "running"`.
    ///
    /// **Important identifiers in response:**
    /// - `command_id`: use with check_command_status (poll),
    ///   get_command_output (full text), cancel_command (interrupt)
    ///
    /// **Workflow for long-running commands:**
    /// 1. execute_command with a short timeout -> `status: "running"`
    /// 2. check_command_status(command_id) until terminal
    /// 3. get_command_output(command_id) if more detail is needed
    ///
    /// **Only one command runs at a time.** Calling this while a
    /// command is in flight returns a `busy` error naming the current
    /// command_id; nothing is written to the shell.
    ///
    /// **OUTPUT_MODE options:**
    /// - `auto` (default): full output for small or failing commands;
    ///   otherwise a class-specific reduction (install summary,
    ///   head/tail preview for listings, searches, and generic output)
    /// - `full`: complete output, terminal control sequences stripped
    /// - `preview`: first/last lines with an omitted-line marker
    /// - `summary`: metadata only (line count, errors, exit code)
    /// - `minimal`: status plus a retrieval pointer
    /// - `raw`: the retained buffer verbatim, nothing stripped
    ///
    /// Failing output is always preserved: when an error is detected,
    /// auto mode returns at least the context from twenty lines
    /// before the first error to the end of the buffer.
    ///
    /// **Return status values:** `completed`, `cancelled`, `timeout`,
    /// `interrupted` (session lost), or `running` (wait elapsed).
    async fn execute_command(
        &self,
        /// The command to execute
        command: String,
        /// Seconds to wait synchronously for completion (default: 10)
        timeout: Option<u64>,
        /// Output format: auto, full, preview, summary, minimal, raw
        output_mode: Option<String>,
        /// Associate the command with a conversation for later retrieval
        conversation_id: Option<String>,
    ) -> Result<StructuredContent<ExecuteCommandResponse>, String> {
        let mode = parse_mode(output_mode)?;
        self.orchestrator
            .execute(&command, timeout, mode, conversation_id)
            .await
            .map(StructuredContent)
            .map_err(agent_err)
    }

    /// Check the status of a command by id.
    ///
    /// Terminal commands carry a payload rendered in the requested
    /// output mode; running commands report progress metadata only
    /// (status, duration so far, bytes buffered).
    ///
    /// **Polling guidance:** use `summary` or `minimal` when polling
    /// frequently to save tokens; switch to `full` (or `auto`) once
    /// the command completes and you need the results.
    ///
    /// **Status values:** `pending`, `running`, `completed`,
    /// `cancelled`, `timeout`, `interrupted`.
    async fn check_command_status(
        &self,
        /// Command ID returned by execute_command
        command_id: String,
        /// Output format: auto, full, preview, summary, minimal, raw
        output_mode: Option<String>,
    ) -> Result<StructuredContent<CommandStatusResponse>, String> {
        let mode = parse_mode(output_mode)?;
        self.orchestrator
            .status(&command_id, mode)
            .await
            .map(StructuredContent)
            .map_err(agent_err)
    }

    /// Retrieve a command's retained output.
    ///
    /// With `raw=true` the buffer comes back verbatim, exactly as
    /// retained (the middle may be elided for very large outputs and
    /// the exit-capture marker is still present); otherwise terminal
    /// control sequences are stripped and newlines normalised first.
    ///
    /// **Warning:** this bypasses all size-based filtering and can
    /// use far more tokens than the filtered output from
    /// execute_command / check_command_status. Works for running
    /// commands too - you get whatever has accumulated so far.
    async fn get_command_output(
        &self,
        /// Command ID
        command_id: String,
        /// Return the buffer without any cleaning
        raw: Option<bool>,
    ) -> Result<StructuredContent<CommandOutputResponse>, String> {
        self.orchestrator
            .fetch_output(&command_id, raw.unwrap_or(false))
            .await
            .map(StructuredContent)
            .map_err(agent_err)
    }

    /// Send Ctrl-C to the in-flight command.
    ///
    /// Use this to stop long-running commands that are no longer
    /// needed. The interrupt is sent immediately; the record
    /// finalises as `cancelled` when the prompt returns, so the
    /// buffer stays consistent - poll check_command_status to see the
    /// transition and collect whatever output accumulated.
    ///
    /// **Note:** cancelling a finished command is a harmless no-op
    /// reported as `cancelled: false` with message `not_running`.
    /// Only the currently in-flight command can actually be
    /// interrupted.
    async fn cancel_command(
        &self,
        /// Command ID to cancel
        command_id: String,
    ) -> Result<StructuredContent<CancelCommandResponse>, String> {
        self.orchestrator
            .cancel(&command_id)
            .await
            .map(StructuredContent)
            .map_err(agent_err)
    }

    /// List tracked commands, most recent first.
    ///
    /// Useful for seeing what is running or recently completed, and
    /// for recovering a lost command_id. Old terminal records beyond
    /// the retention cap are evicted on this call; commands still in
    /// flight are always listed.
    async fn list_commands(
        &self,
        /// Filter by status: pending, running, completed, cancelled, timeout, interrupted
        status_filter: Option<String>,
        /// Maximum records to return
        limit: Option<u64>,
    ) -> Result<StructuredContent<ListCommandsResponse>, String> {
        let status = match status_filter {
            None => None,
            Some(raw) => Some(CommandStatus::parse(&raw).ok_or_else(|| {
                agent_err(BridgeError::Server(format!(
                    "unknown status_filter {:?}",
                    raw
                )))
            })?),
        };
        Ok(StructuredContent(
            self.orchestrator
                .list(status, limit.map(|l| l as usize))
                .await,
        ))
    }
}
