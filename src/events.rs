//! Asynchronous notifications from Tor.
//!
//! Lines that arrive while no command is waiting for a reply (or that the
//! waiting command declines) end up here. Only `650` lines carry
//! notifications; the session cares about client status (bootstrap),
//! stream status and the daemon's own log lines.

use crate::error::Result;
use crate::protocol::{tokenize, unquote, ReplyLine};
use crate::types::*;
use std::collections::HashMap;
use std::str::FromStr;

/// Event types that can be subscribed to with SETEVENTS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Stream status changed.
    Stream,
    /// Notice log message.
    Notice,
    /// Warning log message.
    Warn,
    /// Error log message.
    Error,
    /// General status event.
    StatusGeneral,
    /// Client status event.
    StatusClient,
}

impl EventType {
    /// Get the event name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Stream => "STREAM",
            EventType::Notice => "NOTICE",
            EventType::Warn => "WARN",
            EventType::Error => "ERR",
            EventType::StatusGeneral => "STATUS_GENERAL",
            EventType::StatusClient => "STATUS_CLIENT",
        }
    }
}

impl FromStr for EventType {
    type Err = crate::error::ControlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "STREAM" => Ok(EventType::Stream),
            "NOTICE" => Ok(EventType::Notice),
            "WARN" => Ok(EventType::Warn),
            "ERR" => Ok(EventType::Error),
            "STATUS_GENERAL" => Ok(EventType::StatusGeneral),
            "STATUS_CLIENT" => Ok(EventType::StatusClient),
            other => Err(crate::error::ControlError::ParseError(format!(
                "Unknown event type: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the SETEVENTS argument list, dropping duplicates.
pub fn event_names(events: &[EventType]) -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Vec::with_capacity(events.len());
    for event in events {
        if !names.contains(&event.as_str()) {
            names.push(event.as_str());
        }
    }
    names
}

/// A parsed asynchronous event from Tor.
#[derive(Debug, Clone)]
pub enum Event {
    /// Stream status changed.
    StreamStatus(StreamEvent),
    /// Status event.
    Status(StatusEvent),
    /// Log message.
    Log(LogEvent),
    /// Unknown or unparsed event.
    Unknown {
        /// The event type string.
        event_type: String,
        /// The raw event data.
        data: String,
    },
}

/// Stream status event.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Stream ID.
    pub stream_id: StreamId,
    /// Stream status.
    pub status: StreamStatus,
    /// Circuit ID (0 if unattached).
    pub circuit_id: CircuitId,
    /// Target address and port.
    pub target: String,
}

/// Log message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Log severity.
    pub severity: LogSeverity,
    /// Log message.
    pub message: String,
}

/// Log severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSeverity {
    /// Notice level.
    Notice,
    /// Warning level.
    Warn,
    /// Error level.
    Error,
}

impl LogSeverity {
    /// Get the severity level as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Notice => "NOTICE",
            LogSeverity::Warn => "WARN",
            LogSeverity::Error => "ERR",
        }
    }
}

impl FromStr for LogSeverity {
    type Err = crate::error::ControlError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "NOTICE" => Ok(LogSeverity::Notice),
            "WARN" => Ok(LogSeverity::Warn),
            "ERR" => Ok(LogSeverity::Error),
            other => Err(crate::error::ControlError::ParseError(format!(
                "Unknown log severity: {}",
                other
            ))),
        }
    }
}

/// Status event.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    /// Status type.
    pub status_type: StatusType,
    /// Severity token (`NOTICE`, `WARN`, `ERR`).
    pub severity: String,
    /// Action.
    pub action: String,
    /// Additional arguments, with quoted values unquoted.
    pub arguments: HashMap<String, String>,
}

impl StatusEvent {
    /// Bootstrap percentage carried by a client `BOOTSTRAP` status.
    pub fn bootstrap_progress(&self) -> Option<u8> {
        if self.status_type != StatusType::Client || self.action != "BOOTSTRAP" {
            return None;
        }
        self.arguments
            .get("PROGRESS")
            .and_then(|p| p.parse::<u8>().ok())
            .filter(|p| *p <= 100)
    }
}

/// Status event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusType {
    /// General status.
    General,
    /// Client status.
    Client,
}

impl StatusType {
    /// Get the status type as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusType::General => "GENERAL",
            StatusType::Client => "CLIENT",
        }
    }
}

/// Classify one unsolicited line.
///
/// Returns `Ok(None)` for well-formed lines that are not notifications.
pub fn parse_notification(line: &str) -> Result<Option<Event>> {
    let reply = ReplyLine::parse(line)?;
    if !reply.is_async_event() {
        return Ok(None);
    }
    let (event_type, data) = reply.split_type();
    Ok(Some(parse_event(event_type, data)))
}

/// Parse an event from raw event text.
pub fn parse_event(event_type: &str, text: &str) -> Event {
    match event_type.to_uppercase().as_str() {
        "STREAM" => parse_stream_event(text),
        "STATUS_CLIENT" => parse_status_event(StatusType::Client, text),
        "STATUS_GENERAL" => parse_status_event(StatusType::General, text),
        "NOTICE" | "WARN" | "ERR" => parse_log_event(event_type, text),
        _ => Event::Unknown {
            event_type: event_type.to_string(),
            data: text.to_string(),
        },
    }
}

fn parse_stream_event(text: &str) -> Event {
    let parts = tokenize(text);

    let stream_id = parts
        .first()
        .and_then(|s| s.parse().ok())
        .map(StreamId)
        .unwrap_or(StreamId(0));

    let status = parts
        .get(1)
        .and_then(|s| StreamStatus::from_str(s).ok())
        .unwrap_or(StreamStatus::Unknown);

    let circuit_id = parts
        .get(2)
        .and_then(|s| s.parse().ok())
        .map(CircuitId)
        .unwrap_or(CircuitId(0));

    let target = parts.get(3).unwrap_or(&"").to_string();

    Event::StreamStatus(StreamEvent {
        stream_id,
        status,
        circuit_id,
        target,
    })
}

fn parse_status_event(status_type: StatusType, text: &str) -> Event {
    let tokens = tokenize(text);

    let severity = tokens.first().unwrap_or(&"").to_string();
    let action = tokens.get(1).unwrap_or(&"").to_string();
    let arguments = tokens
        .iter()
        .skip(2)
        .filter_map(|token| token.split_once('='))
        .map(|(key, value)| (key.to_string(), unquote(value)))
        .collect();

    Event::Status(StatusEvent {
        status_type,
        severity,
        action,
        arguments,
    })
}

fn parse_log_event(severity: &str, text: &str) -> Event {
    let severity = LogSeverity::from_str(severity).unwrap_or(LogSeverity::Notice);

    Event::Log(LogEvent {
        severity,
        message: text.to_string(),
    })
}
