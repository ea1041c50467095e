//! Serializable types for the agent tool surface and the viewer wire.
//!
//! Tool response types derive `Serialize`, `Deserialize`, and
//! `JsonSchema` for MCP protocol compatibility. Viewer frames are the
//! JSON messages exchanged with browser terminals over the WebSocket.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::record::CommandStatus;

/// Metadata about a command's retained buffer.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BufferInfo {
    /// Lines in the cleaned output.
    pub line_count: usize,
    /// Bytes ever produced, including any elided middle.
    pub total_bytes: u64,
    /// Whether the middle of the buffer was elided.
    pub truncated: bool,
}

/// Connection metadata for the single active session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionInfo {
    pub session_id: String,
    pub host: String,
    pub username: String,
    pub connected_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectResponse {
    pub session_id: String,
    pub host: String,
    pub username: String,
    pub authenticated: bool,
    /// Retry attempts needed to establish the connection.
    pub retry_attempts: u32,
    /// Learned shell prompt signature.
    pub prompt_signature: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteCommandResponse {
    pub command_id: String,
    pub status: CommandStatus,
    /// Filtered payload; absent while the command is still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_errors: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub buffer_info: BufferInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CommandStatusResponse {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_errors: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    pub buffer_info: BufferInfo,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CommandOutputResponse {
    pub command_id: String,
    pub output: String,
    pub buffer_info: BufferInfo,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CancelCommandResponse {
    pub command_id: String,
    /// False when the command was not running (terminal or unknown
    /// in-flight state); cancel on a finished command is a no-op.
    pub cancelled: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandListItem {
    pub command_id: String,
    pub command: String,
    pub status: CommandStatus,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ListCommandsResponse {
    pub commands: Vec<CommandListItem>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TerminalStatusResponse {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Browser terminals currently attached.
    pub viewer_count: usize,
}

/// Browser -> server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keystrokes typed into the browser terminal.
    Input { data: String },
    /// The browser terminal was resized.
    Resize { cols: u32, rows: u32 },
}

/// Server -> browser frames. Strictly ordered per viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Raw shell output, verbatim.
    Output { data: String },
    /// Session connectivity changed.
    Status { connected: bool },
}
