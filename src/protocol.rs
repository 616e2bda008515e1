//! Protocol message parsing and formatting.
//!
//! This module handles the low-level protocol details for communicating
//! with Tor's control port: turning raw bytes into lines, splitting
//! status lines into their parts, and formatting outgoing commands.

use crate::error::{ControlError, Result, StatusCode};

/// A raw reply line from Tor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// The 3-digit status code.
    pub code: u16,
    /// The separator character: '-' for mid-reply, '+' for data, ' ' for end.
    pub separator: char,
    /// The text content of the line.
    pub text: String,
}

impl ReplyLine {
    /// Parse a reply line from a string.
    pub fn parse(line: &str) -> Result<Self> {
        if line.len() < 4 {
            return Err(ControlError::ProtocolError(format!(
                "Reply line too short: '{}'",
                line
            )));
        }

        let code: u16 = line
            .get(..3)
            .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| {
                ControlError::ProtocolError(format!("Invalid status code in: '{}'", line))
            })?;

        let separator = line[3..].chars().next().ok_or_else(|| {
            ControlError::ProtocolError(format!("Missing separator in: '{}'", line))
        })?;

        if !matches!(separator, ' ' | '-' | '+') {
            return Err(ControlError::ProtocolError(format!(
                "Invalid separator '{}' in: '{}'",
                separator, line
            )));
        }

        Ok(ReplyLine {
            code,
            separator,
            text: line[4..].to_string(),
        })
    }

    /// Check if this is the final line of a reply.
    pub fn is_end(&self) -> bool {
        self.separator == ' '
    }

    /// Check if this is a data line (multi-line response).
    pub fn is_data(&self) -> bool {
        self.separator == '+'
    }

    /// Check if this is a mid-reply line.
    pub fn is_mid(&self) -> bool {
        self.separator == '-'
    }

    /// Get the status code as an enum.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code)
    }

    /// Check if this line carries an asynchronous notification.
    pub fn is_async_event(&self) -> bool {
        self.code == StatusCode::AsyncEvent.as_u16()
    }

    /// Split the text into its leading type token and the remainder.
    pub fn split_type(&self) -> (&str, &str) {
        match self.text.split_once(' ') {
            Some((kind, rest)) => (kind, rest),
            None => (self.text.as_str(), ""),
        }
    }
}

/// Turns a byte stream into protocol lines.
///
/// Chunks may end mid-line; the tail is kept until its newline arrives.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_end_matches(['\r', '\n']);
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Number of buffered bytes not yet terminated by a newline.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Split text on spaces that are not inside a `"..."` span.
///
/// Quotes are kept in the returned tokens; backslash escapes inside a
/// quoted span do not end it.
pub fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut start = None;
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                start.get_or_insert(i);
            }
            ' ' if !in_quotes => {
                if let Some(s) = start.take() {
                    tokens.push(&text[s..i]);
                }
            }
            _ => {
                start.get_or_insert(i);
            }
        }
    }

    if let Some(s) = start {
        tokens.push(&text[s..]);
    }
    tokens
}

/// Strip surrounding quotes from a value, resolving escape sequences.
///
/// Unquoted values are returned as they are.
pub fn unquote(value: &str) -> String {
    if value.starts_with('"') {
        parse_quoted_string(value).0
    } else {
        value.to_string()
    }
}

/// Parse a quoted string, handling escape sequences.
fn parse_quoted_string(s: &str) -> (String, &str) {
    if !s.starts_with('"') {
        return (String::new(), s);
    }

    let mut result = String::new();
    let mut chars = s[1..].chars().peekable();
    let mut consumed = 1;

    while let Some(c) = chars.next() {
        consumed += c.len_utf8();
        if c == '"' {
            break;
        } else if c == '\\' {
            if let Some(&next) = chars.peek() {
                consumed += next.len_utf8();
                chars.next();
                match next {
                    'n' => result.push('\n'),
                    'r' => result.push('\r'),
                    't' => result.push('\t'),
                    _ => result.push(next),
                }
            }
        } else {
            result.push(c);
        }
    }

    (result, &s[consumed..])
}

/// Quote a string for use in a Tor control command.
pub fn quote_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('"');

    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            _ => result.push(c),
        }
    }

    result.push('"');
    result
}

/// Format a command with arguments.
pub fn format_command(keyword: &str, args: &[&str]) -> String {
    let mut cmd = keyword.to_string();
    for arg in args {
        cmd.push(' ');
        cmd.push_str(arg);
    }
    cmd.push_str("\r\n");
    cmd
}

/// Undo the leading-dot escape of a line inside a data block.
pub fn unescape_data_line(line: &str) -> &str {
    if line.starts_with("..") {
        &line[1..]
    } else {
        line
    }
}
