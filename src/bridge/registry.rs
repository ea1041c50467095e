//! Command registry: retained records keyed by opaque id.
//!
//! `DashMap` gives lock-free concurrent access for the broadcast pump
//! (appends) and agent handlers (snapshots); a small ordered index
//! tracks insertion order for listing and eviction. Eviction is
//! pull-based: callers invoke [`CommandRegistry::evict`] from the
//! listing/status paths, dropping the oldest terminal records beyond
//! the retention cap. Records still in flight are never evicted.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use dashmap::DashMap;
use tracing::debug;

use super::error::BridgeError;
use super::record::{CommandEntry, CommandInfo, CommandStatus};

/// One row of `list_commands` output.
#[derive(Debug, Clone)]
pub struct CommandSnapshot {
    pub info: CommandInfo,
    pub status: CommandStatus,
}

pub struct CommandRegistry {
    commands: DashMap<String, Arc<CommandEntry>>,
    /// Insertion order of command ids, oldest first.
    order: StdMutex<Vec<String>>,
    max_history: usize,
    buffer_max_bytes: usize,
}

impl CommandRegistry {
    pub fn new(max_history: usize, buffer_max_bytes: usize) -> Self {
        Self {
            commands: DashMap::new(),
            order: StdMutex::new(Vec::new()),
            max_history,
            buffer_max_bytes,
        }
    }

    /// Register a new record in `pending`. Ids are caller-generated
    /// UUIDs and must be unique for the process lifetime.
    pub fn create(
        &self,
        command_id: String,
        command: String,
        conversation_id: Option<String>,
    ) -> Result<Arc<CommandEntry>, BridgeError> {
        if self.commands.contains_key(&command_id) {
            return Err(BridgeError::Server(format!(
                "command id collision: {}",
                command_id
            )));
        }

        let entry = Arc::new(CommandEntry::new(
            CommandInfo {
                command_id: command_id.clone(),
                command,
                conversation_id,
                created_at: chrono::Utc::now().to_rfc3339(),
            },
            self.buffer_max_bytes,
        ));

        self.commands.insert(command_id.clone(), entry.clone());
        self.order
            .lock()
            .expect("order index poisoned")
            .push(command_id);
        Ok(entry)
    }

    pub fn get(&self, command_id: &str) -> Option<Arc<CommandEntry>> {
        self.commands.get(command_id).map(|e| e.value().clone())
    }

    /// Append output bytes to a record. Legal only while `running`;
    /// appends to any other state are a programming fault.
    pub async fn append(&self, command_id: &str, bytes: &[u8]) -> Result<(), BridgeError> {
        let entry = self
            .get(command_id)
            .ok_or_else(|| BridgeError::UnknownCommandId(command_id.to_string()))?;

        let status = entry.status();
        if status != CommandStatus::Running {
            return Err(BridgeError::InvalidStateTransition {
                from: status,
                to: CommandStatus::Running,
            });
        }

        entry.buffer.lock().await.append(bytes);
        Ok(())
    }

    /// Apply a state-machine edge on a record.
    pub async fn transition(
        &self,
        command_id: &str,
        to: CommandStatus,
    ) -> Result<(), BridgeError> {
        let entry = self
            .get(command_id)
            .ok_or_else(|| BridgeError::UnknownCommandId(command_id.to_string()))?;
        entry.transition(to).await
    }

    /// Transition every non-terminal record to `interrupted`; used at
    /// session teardown.
    pub async fn interrupt_all_active(&self) {
        let active: Vec<Arc<CommandEntry>> = self
            .commands
            .iter()
            .filter(|e| !e.status().is_terminal())
            .map(|e| e.value().clone())
            .collect();

        for entry in active {
            if let Err(e) = entry.transition(CommandStatus::Interrupted).await {
                debug!(
                    "skipping interrupt of {}: {}",
                    entry.info.command_id, e
                );
            }
        }
    }

    /// Snapshot records, most recent first, optionally filtered by
    /// status and capped at `limit`.
    pub fn list(&self, status: Option<CommandStatus>, limit: Option<usize>) -> Vec<CommandSnapshot> {
        let order = self.order.lock().expect("order index poisoned");
        let mut out = Vec::new();

        for id in order.iter().rev() {
            if let Some(entry) = self.commands.get(id) {
                let current = entry.status();
                if status.is_some_and(|wanted| wanted != current) {
                    continue;
                }
                out.push(CommandSnapshot {
                    info: entry.info.clone(),
                    status: current,
                });
                if limit.is_some_and(|cap| out.len() >= cap) {
                    break;
                }
            }
        }
        out
    }

    /// Drop the oldest terminal records beyond the retention cap.
    pub fn evict(&self) {
        let mut order = self.order.lock().expect("order index poisoned");

        let terminal_count = order
            .iter()
            .filter(|id| {
                self.commands
                    .get(id.as_str())
                    .is_some_and(|e| e.status().is_terminal())
            })
            .count();

        if terminal_count <= self.max_history {
            return;
        }

        let mut to_drop = terminal_count - self.max_history;
        order.retain(|id| {
            if to_drop == 0 {
                return true;
            }
            let terminal = self
                .commands
                .get(id.as_str())
                .is_some_and(|e| e.status().is_terminal());
            if terminal {
                self.commands.remove(id.as_str());
                to_drop -= 1;
                debug!("evicted command record {}", id);
                return false;
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
