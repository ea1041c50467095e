//! Prompt detection by learned-signature suffix matching.
//!
//! No shell grammar is modelled. At connect time the session echoes a
//! random marker and, once the stream goes quiet, the last line of the
//! idle terminal is captured as the prompt signature. During a command
//! the detector keeps a rolling window of recent bytes and reports a
//! match whenever the cleaned window ends with that signature.
//!
//! Quiescence is the caller's half of the contract: the broadcast pump
//! arms a grace timer on a match and only commits the boundary if no
//! further bytes arrive before it fires. Prompt-looking substrings in
//! the middle of chatty output never trigger a boundary because the
//! match anchors at end-of-window and new bytes disarm the timer.

use super::ansi;

/// Rolling window capacity. Prompts are short; a few KiB of tail is
/// plenty and keeps the per-chunk cleaning cost flat.
const WINDOW_CAP: usize = 4096;

#[derive(Debug)]
pub struct PromptDetector {
    window: Vec<u8>,
    signature: Option<String>,
}

impl PromptDetector {
    pub fn new() -> Self {
        Self {
            window: Vec::with_capacity(WINDOW_CAP),
            signature: None,
        }
    }

    /// Install the signature captured at session start.
    pub fn set_signature(&mut self, signature: String) {
        let trimmed = signature.trim_end().to_string();
        self.signature = (!trimmed.is_empty()).then_some(trimmed);
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Append freshly drained bytes to the rolling window.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.window.extend_from_slice(bytes);
        if self.window.len() > WINDOW_CAP {
            let excess = self.window.len() - WINDOW_CAP;
            self.window.drain(..excess);
        }
    }

    /// Whether the window currently ends at the shell prompt.
    ///
    /// Trailing whitespace is ignored and ANSI sequences are stripped
    /// before comparison, so coloured prompts match their learned
    /// plain-text signature.
    pub fn is_at_prompt(&self) -> bool {
        let Some(signature) = self.signature.as_deref() else {
            return false;
        };

        let text = ansi::clean(&String::from_utf8_lossy(&self.window));
        let tail = text.trim_end();
        if !tail.ends_with(signature) {
            return false;
        }

        // The signature must occupy the final line by itself-ish: the
        // last line may carry output text before an embedded prompt
        // string, which is not a real prompt.
        let last_line = tail.rsplit('\n').next().unwrap_or(tail);
        last_line.trim_start() == signature || last_line == signature
    }

    /// Clear the window after a boundary is committed.
    pub fn reset(&mut self) {
        self.window.clear();
    }

    /// Extract a signature from idle-terminal text: the last non-empty
    /// cleaned line.
    pub fn learn_from(idle_text: &str) -> Option<String> {
        ansi::clean(idle_text)
            .lines()
            .rev()
            .map(str::trim_end)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}
