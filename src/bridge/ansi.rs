//! Terminal control-sequence handling.
//!
//! The remote shell runs with a PTY, so the raw byte stream carries ANSI
//! colour codes, OSC title updates, carriage returns, and backspaces.
//! Browsers render these directly; the agent-facing pipeline and the
//! prompt detector both work on cleaned text produced here.

/// Strip CSI/OSC/escape sequences and non-printing control characters.
///
/// Backspaces are applied destructively (they erase the previous
/// character), matching what a terminal would display. Newlines, tabs
/// and carriage returns are preserved; use [`normalize_newlines`] to
/// collapse line endings afterwards.
pub fn strip_control_sequences(input: &str) -> String {
    enum State {
        Plain,
        Escape,
        Csi,
        Osc,
        OscEscape,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Plain;

    for ch in input.chars() {
        match state {
            State::Plain => match ch {
                '\u{1b}' => state = State::Escape,
                '\u{08}' => {
                    out.pop();
                }
                '\u{07}' => {}
                c if (c as u32) < 0x20 && c != '\n' && c != '\t' && c != '\r' => {}
                c => out.push(c),
            },
            State::Escape => match ch {
                '[' => state = State::Csi,
                ']' => state = State::Osc,
                // Two-character escape (ESC + single final byte)
                _ => state = State::Plain,
            },
            State::Csi => {
                // Parameter and intermediate bytes are 0x20..=0x3F, the
                // final byte is 0x40..=0x7E and ends the sequence.
                if ('\u{40}'..='\u{7e}').contains(&ch) {
                    state = State::Plain;
                }
            }
            State::Osc => match ch {
                '\u{07}' => state = State::Plain,
                '\u{1b}' => state = State::OscEscape,
                _ => {}
            },
            State::OscEscape => {
                // ESC \ is the OSC string terminator; anything else means
                // the OSC body contained a stray escape, keep consuming.
                if ch == '\\' {
                    state = State::Plain;
                } else {
                    state = State::Osc;
                }
            }
        }
    }

    out
}

/// Collapse `\r\n` and lone `\r` to `\n`.
pub fn normalize_newlines(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Strip control sequences and normalise newlines in one pass.
pub fn clean(input: &str) -> String {
    normalize_newlines(&strip_control_sequences(input))
}
