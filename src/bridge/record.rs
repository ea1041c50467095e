//! Command records, the status state machine, and the in-flight slot.
//!
//! A [`CommandEntry`] is created in `pending`, mutated only by the
//! broadcast pump while `running`, and becomes read-only once it
//! reaches a terminal status. Status changes flow through a `watch`
//! channel so agent handlers can wait for completion without polling.
//!
//! Output is retained in a [`BoundedBuffer`]: appends are verbatim up
//! to a hard ceiling, beyond which the head and tail are kept intact
//! and the middle is elided.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};

use super::error::BridgeError;

/// Lifecycle of a dispatched command.
///
/// `pending -> running -> {completed, cancelled, timeout, interrupted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    /// Created, not yet written to the shell.
    Pending,
    /// Bytes written; output is being attributed to this command.
    Running,
    /// The prompt boundary arrived.
    Completed,
    /// Interrupt was sent after a cancel request.
    Cancelled,
    /// The per-command deadline elapsed without a boundary.
    Timeout,
    /// The session was torn down mid-command.
    Interrupted,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Cancelled
                | CommandStatus::Timeout
                | CommandStatus::Interrupted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Running => "running",
            CommandStatus::Completed => "completed",
            CommandStatus::Cancelled => "cancelled",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Interrupted => "interrupted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommandStatus::Pending),
            "running" => Some(CommandStatus::Running),
            "completed" => Some(CommandStatus::Completed),
            "cancelled" => Some(CommandStatus::Cancelled),
            "timeout" => Some(CommandStatus::Timeout),
            "interrupted" => Some(CommandStatus::Interrupted),
            _ => None,
        }
    }

    /// Whether the state machine permits `from -> to`.
    pub fn transition_allowed(from: CommandStatus, to: CommandStatus) -> bool {
        match (from, to) {
            (CommandStatus::Pending, CommandStatus::Running) => true,
            // Session teardown interrupts commands that never started.
            (CommandStatus::Pending, CommandStatus::Interrupted) => true,
            (CommandStatus::Running, t) => t.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output retention with a hard ceiling.
///
/// Up to `max_bytes` the buffer is a plain append log. Past the
/// ceiling the first half stays frozen as the head and the newest
/// bytes rotate through a tail ring, with an elision count recorded
/// for the gap in between.
#[derive(Debug)]
pub struct BoundedBuffer {
    max_bytes: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    elided_bytes: u64,
    total_bytes: u64,
}

impl BoundedBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes.max(2),
            head: Vec::new(),
            tail: VecDeque::new(),
            elided_bytes: 0,
            total_bytes: 0,
        }
    }

    fn head_budget(&self) -> usize {
        self.max_bytes / 2
    }

    fn tail_budget(&self) -> usize {
        self.max_bytes - self.head_budget()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.total_bytes += bytes.len() as u64;
        let mut rest = bytes;

        if !self.is_truncated() {
            if self.head.len() + rest.len() <= self.max_bytes {
                self.head.extend_from_slice(rest);
                return;
            }
            // Crossing the ceiling: freeze the head at its budget and
            // spill everything else into the tail ring.
            if self.head.len() > self.head_budget() {
                let overflow = self.head.split_off(self.head_budget());
                self.tail.extend(overflow);
            } else {
                let take = (self.head_budget() - self.head.len()).min(rest.len());
                self.head.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
            }
        }

        self.tail.extend(rest.iter().copied());
        let tail_budget = self.tail_budget();
        while self.tail.len() > tail_budget {
            self.tail.pop_front();
            self.elided_bytes += 1;
        }
    }

    pub fn is_truncated(&self) -> bool {
        !self.tail.is_empty() || self.elided_bytes > 0
    }

    /// Bytes ever appended, including elided ones.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn retained_len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    /// The retained bytes, with a textual gap marker where the middle
    /// was elided.
    pub fn snapshot(&self) -> Vec<u8> {
        if self.elided_bytes == 0 {
            let mut out = self.head.clone();
            out.extend(self.tail.iter().copied());
            return out;
        }

        let marker = format!("\n[... {} bytes elided ...]\n", self.elided_bytes);
        let mut out = Vec::with_capacity(self.retained_len() + marker.len());
        out.extend_from_slice(&self.head);
        out.extend_from_slice(marker.as_bytes());
        out.extend(self.tail.iter().copied());
        out
    }

    /// Lossy text of the last `n` retained bytes; used for the exit
    /// marker scan at boundary commit.
    pub fn tail_text(&self, n: usize) -> String {
        let tail_len = self.tail.len();
        if tail_len >= n {
            let bytes: Vec<u8> = self.tail.iter().skip(tail_len - n).copied().collect();
            return String::from_utf8_lossy(&bytes).into_owned();
        }

        let from_head = (n - tail_len).min(self.head.len());
        let mut bytes: Vec<u8> = self.head[self.head.len() - from_head..].to_vec();
        bytes.extend(self.tail.iter().copied());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Immutable identity of a command.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandInfo {
    pub command_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: String,
}

/// Shared state for one dispatched command.
#[derive(Debug)]
pub struct CommandEntry {
    pub info: CommandInfo,
    status_tx: watch::Sender<CommandStatus>,
    status_rx: watch::Receiver<CommandStatus>,
    pub buffer: Mutex<BoundedBuffer>,
    pub exit_code: Mutex<Option<i32>>,
    pub started_at: Mutex<Option<String>>,
    pub completed_at: Mutex<Option<String>>,
    started_instant: Mutex<Option<Instant>>,
    duration_secs: Mutex<Option<f64>>,
    pub boundary_forced: AtomicBool,
}

impl CommandEntry {
    pub fn new(info: CommandInfo, buffer_max_bytes: usize) -> Self {
        let (status_tx, status_rx) = watch::channel(CommandStatus::Pending);
        Self {
            info,
            status_tx,
            status_rx,
            buffer: Mutex::new(BoundedBuffer::new(buffer_max_bytes)),
            exit_code: Mutex::new(None),
            started_at: Mutex::new(None),
            completed_at: Mutex::new(None),
            started_instant: Mutex::new(None),
            duration_secs: Mutex::new(None),
            boundary_forced: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> CommandStatus {
        *self.status_rx.borrow()
    }

    /// A receiver for waiting on status changes.
    pub fn watch_status(&self) -> watch::Receiver<CommandStatus> {
        self.status_rx.clone()
    }

    /// Apply a state-machine edge, stamping timestamps as a side
    /// effect. Illegal edges are rejected.
    pub async fn transition(&self, to: CommandStatus) -> Result<(), BridgeError> {
        let from = self.status();
        if !CommandStatus::transition_allowed(from, to) {
            return Err(BridgeError::InvalidStateTransition { from, to });
        }

        match to {
            CommandStatus::Running => {
                *self.started_at.lock().await = Some(chrono::Utc::now().to_rfc3339());
                *self.started_instant.lock().await = Some(Instant::now());
            }
            t if t.is_terminal() => {
                *self.completed_at.lock().await = Some(chrono::Utc::now().to_rfc3339());
                let started = *self.started_instant.lock().await;
                *self.duration_secs.lock().await =
                    Some(started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0));
            }
            _ => {}
        }

        let _ = self.status_tx.send(to);
        Ok(())
    }

    /// Seconds spent running: frozen at the terminal transition,
    /// monotonic while still in flight.
    pub async fn duration_secs(&self) -> Option<f64> {
        if let Some(frozen) = *self.duration_secs.lock().await {
            return Some(frozen);
        }
        self.started_instant
            .lock()
            .await
            .map(|s| s.elapsed().as_secs_f64())
    }

    pub fn set_boundary_forced(&self) {
        self.boundary_forced.store(true, Ordering::SeqCst);
    }

    pub fn was_boundary_forced(&self) -> bool {
        self.boundary_forced.load(Ordering::SeqCst)
    }
}

/// Wait until the watched status becomes terminal, returning it.
pub async fn wait_for_terminal(rx: &mut watch::Receiver<CommandStatus>) -> CommandStatus {
    loop {
        let status = *rx.borrow();
        if status.is_terminal() {
            return status;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

/// The at-most-one-running-command invariant's storage: either empty
/// or holding the id of the in-flight command plus the terminal status
/// the next boundary should commit.
pub struct InFlightSlot {
    inner: Mutex<Option<InFlight>>,
}

pub struct InFlight {
    pub command_id: String,
    /// Terminal status the boundary commit will apply. `Completed`
    /// unless a cancel or deadline re-aimed it first.
    pub intended: CommandStatus,
}

impl InFlightSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Claim the slot for `command_id`; fails fast with the current
    /// occupant when busy.
    pub async fn try_claim(&self, command_id: &str) -> Result<(), BridgeError> {
        let mut slot = self.inner.lock().await;
        if let Some(current) = slot.as_ref() {
            return Err(BridgeError::Busy(current.command_id.clone()));
        }
        *slot = Some(InFlight {
            command_id: command_id.to_string(),
            intended: CommandStatus::Completed,
        });
        Ok(())
    }

    /// Re-aim the terminal status the next boundary will commit.
    /// Returns false if `command_id` is not the occupant.
    pub async fn set_intended(&self, command_id: &str, intended: CommandStatus) -> bool {
        let mut slot = self.inner.lock().await;
        match slot.as_mut() {
            Some(current) if current.command_id == command_id => {
                current.intended = intended;
                true
            }
            _ => false,
        }
    }

    /// Release the slot, returning the occupant if any.
    pub async fn take(&self) -> Option<InFlight> {
        self.inner.lock().await.take()
    }

    /// Release the slot only if `command_id` is the occupant.
    pub async fn take_if(&self, command_id: &str) -> Option<InFlight> {
        let mut slot = self.inner.lock().await;
        if slot.as_ref().is_some_and(|c| c.command_id == command_id) {
            return slot.take();
        }
        None
    }

    pub async fn current_id(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .as_ref()
            .map(|c| c.command_id.clone())
    }
}

impl Default for InFlightSlot {
    fn default() -> Self {
        Self::new()
    }
}
