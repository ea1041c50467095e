//! Agent-facing output filtering.
//!
//! Raw shell output fans out verbatim to browsers; the agent gets a
//! payload shaped by an output mode and a classification of the
//! command. Every policy here is deterministic given its inputs.
//!
//! Mode semantics:
//!
//! - `raw`: the retained buffer verbatim, exit marker included.
//! - `full`: control sequences stripped, newlines normalised, exit
//!   marker scrubbed.
//! - `preview`: head/tail lines joined by an omitted-line marker.
//! - `summary`: metadata only.
//! - `minimal`: status plus a retrieval pointer.
//! - `auto`: full for small or failing outputs; otherwise a
//!   class-specific reduction (install summary, preview for the rest).
//!
//! When the output carries an error, auto mode always preserves the
//! context from twenty lines before the first error token to the end,
//! and `minimal` is upgraded to `summary`.

use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ansi;
use super::config::{ClassThresholds, Truncation};
use super::record::CommandStatus;

/// Agent-facing output modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Auto,
    Full,
    Preview,
    Summary,
    Minimal,
    Raw,
}

impl OutputMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto" => Some(OutputMode::Auto),
            "full" => Some(OutputMode::Full),
            "preview" => Some(OutputMode::Preview),
            "summary" => Some(OutputMode::Summary),
            "minimal" => Some(OutputMode::Minimal),
            "raw" => Some(OutputMode::Raw),
            _ => None,
        }
    }
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Auto
    }
}

/// Command classification for auto-mode thresholds, first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Install,
    FileListing,
    LogSearch,
    Generic,
}

static INSTALL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        ^\s*(?:sudo\s+)?
        (?: (?:apt(?:-get)?|yum|dnf|apk|brew|pacman|pip3?|npm|pnpm|yarn|gem|cargo)\b
            .*\b(?:install|add|upgrade|update|build)\b
          | (?:make|cmake|mvn|gradle)\b
        )",
    )
    .expect("install regex")
});

static FILE_LISTING_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:sudo\s+)?(?:ls|find|tree|du)\b").expect("file listing regex")
});

static LOG_SEARCH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?x) ^\s*(?:sudo\s+)?(?:grep|egrep|fgrep|rg|zgrep|ack|journalctl)\b | \|\s*(?:grep|rg)\b")
        .expect("log search regex")
});

impl CommandClass {
    pub fn classify(command: &str) -> Self {
        if INSTALL_RE.is_match(command) {
            CommandClass::Install
        } else if FILE_LISTING_RE.is_match(command) {
            CommandClass::FileListing
        } else if LOG_SEARCH_RE.is_match(command) {
            CommandClass::LogSearch
        } else {
            CommandClass::Generic
        }
    }

    pub fn threshold(&self, thresholds: &ClassThresholds) -> usize {
        match self {
            CommandClass::Install => thresholds.install,
            CommandClass::FileListing => thresholds.file_listing,
            CommandClass::LogSearch => thresholds.log_search,
            CommandClass::Generic => thresholds.generic,
        }
    }
}

/// Fixed error-token scan, case-insensitive.
const ERROR_TOKENS: &[&str] = &[
    "error",
    "fatal",
    "critical",
    "permission denied",
    "no such file",
    "command not found",
    "segmentation fault",
    "traceback",
    "panic:",
];

/// Lines of context preserved before the first error token.
const ERROR_CONTEXT_LINES: usize = 20;

fn line_has_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_TOKENS.iter().any(|t| lower.contains(t))
}

fn first_error_line(lines: &[&str]) -> Option<usize> {
    lines.iter().position(|l| line_has_error(l))
}

/// Drop the idle-prompt line the boundary leaves at the end of the
/// buffer; it belongs to the terminal, not to the command's output.
fn strip_trailing_prompt(text: &str, signature: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    if lines.last().is_some_and(|l| l.trim() == signature) {
        lines.pop();
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        return lines.join("\n");
    }
    text.to_string()
}

/// Exit-code capture marker appended to every dispatched command.
///
/// The per-session salt keeps legitimate output from colliding with
/// the marker; the scrubber removes every line carrying the salt from
/// agent payloads (the echoed command line included).
#[derive(Debug, Clone)]
pub struct ExitMarker {
    salt: String,
    capture: Regex,
}

impl ExitMarker {
    pub fn new() -> Self {
        let salt: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self::with_salt(&salt)
    }

    pub fn with_salt(salt: &str) -> Self {
        let capture = Regex::new(&format!(r"__RTX_{}__:(-?\d+)__END__", regex::escape(salt)))
            .expect("exit marker regex");
        Self {
            salt: salt.to_string(),
            capture,
        }
    }

    /// The token any marker-bearing line contains.
    pub fn token(&self) -> String {
        format!("__RTX_{}__", self.salt)
    }

    /// Shell suffix appended to a dispatched command.
    pub fn command_suffix(&self) -> String {
        format!("; echo __RTX_{}__:$?__END__", self.salt)
    }

    /// Remove marker-bearing lines and extract the exit code from the
    /// last resolved marker occurrence.
    pub fn scrub(&self, text: &str) -> (String, Option<i32>) {
        let token = self.token();
        let exit_code = self
            .capture
            .captures_iter(text)
            .last()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok());

        if !text.contains(&token) {
            return (text.to_string(), exit_code);
        }

        let kept: Vec<&str> = text
            .lines()
            .filter(|line| !line.contains(&token))
            .collect();
        (kept.join("\n"), exit_code)
    }

    /// Extract the exit code without rewriting the text; used at
    /// boundary commit on the buffer tail.
    pub fn extract_exit_code(&self, text: &str) -> Option<i32> {
        self.capture
            .captures_iter(text)
            .last()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok())
    }
}

impl Default for ExitMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Inputs for one filtering pass.
pub struct FilterRequest<'a> {
    pub command_id: &'a str,
    pub command: &'a str,
    pub raw: &'a str,
    pub mode: OutputMode,
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub duration_secs: Option<f64>,
    pub marker: Option<&'a ExitMarker>,
    /// Session prompt signature; a trailing prompt line is dropped
    /// from cleaned payloads.
    pub prompt: Option<&'a str>,
}

/// The agent-facing result of a filtering pass.
#[derive(Debug, Clone)]
pub struct FilteredPayload {
    /// Mode actually applied (`minimal` may upgrade to `summary`).
    pub mode: OutputMode,
    pub text: String,
    /// Line count of the cleaned output, before any reduction.
    pub line_count: usize,
    /// Byte count of the raw buffer.
    pub byte_count: usize,
    pub has_errors: bool,
    pub exit_code: Option<i32>,
}

pub struct OutputFilter {
    thresholds: ClassThresholds,
    truncation: Truncation,
}

impl OutputFilter {
    pub fn new(thresholds: ClassThresholds, truncation: Truncation) -> Self {
        Self {
            thresholds,
            truncation,
        }
    }

    pub fn render(&self, req: &FilterRequest<'_>) -> FilteredPayload {
        let cleaned = ansi::clean(req.raw);
        let (scrubbed, marker_code) = match req.marker {
            Some(marker) => marker.scrub(&cleaned),
            None => (cleaned, None),
        };
        let scrubbed = match req.prompt {
            Some(signature) if !signature.is_empty() => {
                strip_trailing_prompt(&scrubbed, signature)
            }
            _ => scrubbed,
        };
        let exit_code = req.exit_code.or(marker_code);

        let lines: Vec<&str> = scrubbed.lines().collect();
        let line_count = lines.len();
        let byte_count = req.raw.len();
        let has_errors =
            first_error_line(&lines).is_some() || exit_code.is_some_and(|c| c != 0);

        let class = CommandClass::classify(req.command);
        let threshold = class.threshold(&self.thresholds);

        let (mode, text) = match req.mode {
            OutputMode::Raw => (OutputMode::Raw, req.raw.to_string()),
            OutputMode::Full => (OutputMode::Full, scrubbed.clone()),
            OutputMode::Preview => (OutputMode::Preview, self.head_tail(&lines)),
            OutputMode::Summary => (
                OutputMode::Summary,
                self.summary_text(req, line_count, byte_count, has_errors, exit_code, &lines),
            ),
            OutputMode::Minimal if has_errors => (
                OutputMode::Summary,
                self.summary_text(req, line_count, byte_count, has_errors, exit_code, &lines),
            ),
            OutputMode::Minimal => (
                OutputMode::Minimal,
                format!(
                    "status: {}; output withheld, retrieve with get_command_output(\"{}\")",
                    req.status, req.command_id
                ),
            ),
            OutputMode::Auto => {
                if has_errors {
                    (OutputMode::Auto, self.error_context(req, &lines, threshold))
                } else if line_count <= threshold {
                    (OutputMode::Auto, scrubbed.clone())
                } else if class == CommandClass::Install {
                    (OutputMode::Auto, self.install_summary(req, &lines))
                } else {
                    (OutputMode::Auto, self.head_tail(&lines))
                }
            }
        };

        FilteredPayload {
            mode,
            text,
            line_count,
            byte_count,
            has_errors,
            exit_code,
        }
    }

    /// Head/tail reduction with an omitted-line marker.
    fn head_tail(&self, lines: &[&str]) -> String {
        let head = self.truncation.head_lines;
        let tail = self.truncation.tail_lines;

        if lines.len() <= head + tail {
            return lines.join("\n");
        }

        let omitted = lines.len() - head - tail;
        let mut out = lines[..head].join("\n");
        out.push_str(&format!("\n\n[... {} lines omitted ...]\n\n", omitted));
        out.push_str(&lines[lines.len() - tail..].join("\n"));
        out
    }

    /// Everything from twenty lines before the first error token to
    /// the end of the buffer, with a short header when reduced.
    fn error_context(&self, req: &FilterRequest<'_>, lines: &[&str], threshold: usize) -> String {
        // Small failing outputs go back whole.
        if lines.len() <= threshold {
            return lines.join("\n");
        }

        let start = first_error_line(lines)
            .map(|i| i.saturating_sub(ERROR_CONTEXT_LINES))
            .unwrap_or_else(|| lines.len().saturating_sub(ERROR_CONTEXT_LINES));

        let mut out = format!(
            "[error detected] command: {} ({} lines total, showing from line {})\n",
            req.command,
            lines.len(),
            start + 1
        );
        out.push_str(&lines[start..].join("\n"));
        out
    }

    /// Install-class reduction: counts plus the informative lines.
    fn install_summary(&self, req: &FilterRequest<'_>, lines: &[&str]) -> String {
        static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)^\s*(setting up|unpacking|installing|installed|fetched|downloading|building|compiling)\b")
                .expect("install progress regex")
        });

        let package_count = lines
            .iter()
            .filter(|l| l.to_lowercase().starts_with("setting up"))
            .count();
        let highlights: Vec<&str> = lines
            .iter()
            .filter(|l| PROGRESS_RE.is_match(l))
            .take(15)
            .copied()
            .collect();

        let mut out = format!(
            "[install summary] command: {} ({} lines)\n",
            req.command,
            lines.len()
        );
        if package_count > 0 {
            out.push_str(&format!("packages set up: {}\n", package_count));
        }
        if !highlights.is_empty() {
            out.push_str(&highlights.join("\n"));
            out.push('\n');
        }
        let tail_start = lines.len().saturating_sub(10);
        out.push_str(&lines[tail_start..].join("\n"));
        out
    }

    fn summary_text(
        &self,
        req: &FilterRequest<'_>,
        line_count: usize,
        byte_count: usize,
        has_errors: bool,
        exit_code: Option<i32>,
        lines: &[&str],
    ) -> String {
        let first_line = lines.first().copied().unwrap_or("");
        let mut out = format!(
            "lines: {}, bytes: {}, errors: {}",
            line_count, byte_count, has_errors
        );
        if let Some(code) = exit_code {
            out.push_str(&format!(", exit_code: {}", code));
        }
        if let Some(duration) = req.duration_secs {
            out.push_str(&format!(", duration: {:.1}s", duration));
        }
        if !first_line.is_empty() {
            out.push_str(&format!("\nfirst line: {}", first_line));
        }
        out
    }
}
