//! Error types for the control session.
//!
//! Only authentication rejections and transport failures end a session.
//! Lookup misses are modelled as `Option`s by the callers and never show
//! up here.

use std::io;
use thiserror::Error;

/// The main error type for all control-session operations.
#[derive(Error, Debug)]
pub enum ControlError {
    /// I/O error occurred during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection to the control port failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The daemon refused our credential.
    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// Command was rejected by Tor.
    #[error("Command rejected (code {code}): {message}")]
    CommandRejected {
        /// The status code returned by Tor.
        code: u16,
        /// The human-readable error message.
        message: String,
    },

    /// Protocol error - unexpected response format.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Parsing error when interpreting Tor's response.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Timeout waiting for the transport.
    #[error("Operation timed out")]
    Timeout,

    /// The connection was closed before the operation finished.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid argument provided to a command.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The session is not in a state that allows the operation.
    #[error("Invalid session state: {0}")]
    InvalidState(String),
}

impl ControlError {
    /// Whether this error comes from the transport rather than from Tor.
    ///
    /// Transport failures are reported as session termination, never as
    /// a session failure.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ControlError::Io(_) | ControlError::ConnectionClosed | ControlError::Timeout
        )
    }
}

impl Clone for ControlError {
    fn clone(&self) -> Self {
        match self {
            // io::Error is not Clone; keep its kind and message.
            ControlError::Io(e) => ControlError::Io(io::Error::new(e.kind(), e.to_string())),
            ControlError::ConnectionFailed(m) => ControlError::ConnectionFailed(m.clone()),
            ControlError::AuthenticationRejected(m) => {
                ControlError::AuthenticationRejected(m.clone())
            }
            ControlError::CommandRejected { code, message } => ControlError::CommandRejected {
                code: *code,
                message: message.clone(),
            },
            ControlError::ProtocolError(m) => ControlError::ProtocolError(m.clone()),
            ControlError::ParseError(m) => ControlError::ParseError(m.clone()),
            ControlError::ConfigurationError(m) => ControlError::ConfigurationError(m.clone()),
            ControlError::Timeout => ControlError::Timeout,
            ControlError::ConnectionClosed => ControlError::ConnectionClosed,
            ControlError::InvalidArgument(m) => ControlError::InvalidArgument(m.clone()),
            ControlError::InvalidState(m) => ControlError::InvalidState(m.clone()),
        }
    }
}

/// Result type alias for control operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// A final error line received in reply to a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// The 3-digit status code.
    pub code: u16,
    /// The rest of the line.
    pub message: String,
}

impl Rejection {
    /// Whether Tor refused the credential (514 or 515).
    pub fn is_authentication(&self) -> bool {
        matches!(
            StatusCode::from_u16(self.code),
            StatusCode::AuthenticationRequired | StatusCode::BadAuthentication
        )
    }
}

impl From<Rejection> for ControlError {
    fn from(rejection: Rejection) -> Self {
        ControlError::CommandRejected {
            code: rejection.code,
            message: rejection.message,
        }
    }
}

/// Tor reply status codes as defined in the control-spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// 250 - OK
    Ok = 250,
    /// 251 - Operation was unnecessary
    OperationUnnecessary = 251,
    /// 252 - Resource exhausted (with additional info)
    ResourceExhaustedInfo = 252,
    /// 451 - Resource exhausted
    ResourceExhausted = 451,
    /// 500 - Syntax error: protocol
    SyntaxErrorProtocol = 500,
    /// 510 - Unrecognized command
    UnrecognizedCommand = 510,
    /// 511 - Unimplemented command
    UnimplementedCommand = 511,
    /// 512 - Syntax error in command argument
    SyntaxErrorArgument = 512,
    /// 513 - Unrecognized command argument
    UnrecognizedArgument = 513,
    /// 514 - Authentication required
    AuthenticationRequired = 514,
    /// 515 - Bad authentication
    BadAuthentication = 515,
    /// 550 - Unspecified Tor error
    UnspecifiedError = 550,
    /// 551 - Internal error
    InternalError = 551,
    /// 552 - Unrecognized entity
    UnrecognizedEntity = 552,
    /// 553 - Invalid configuration value
    InvalidConfigValue = 553,
    /// 554 - Invalid descriptor
    InvalidDescriptor = 554,
    /// 555 - Unmanaged entity
    UnmanagedEntity = 555,
    /// 650 - Asynchronous event notification
    AsyncEvent = 650,
    /// Unknown status code
    Unknown = 0,
}

impl StatusCode {
    /// Parse a status code from a u16 value.
    pub fn from_u16(code: u16) -> Self {
        match code {
            250 => StatusCode::Ok,
            251 => StatusCode::OperationUnnecessary,
            252 => StatusCode::ResourceExhaustedInfo,
            451 => StatusCode::ResourceExhausted,
            500 => StatusCode::SyntaxErrorProtocol,
            510 => StatusCode::UnrecognizedCommand,
            511 => StatusCode::UnimplementedCommand,
            512 => StatusCode::SyntaxErrorArgument,
            513 => StatusCode::UnrecognizedArgument,
            514 => StatusCode::AuthenticationRequired,
            515 => StatusCode::BadAuthentication,
            550 => StatusCode::UnspecifiedError,
            551 => StatusCode::InternalError,
            552 => StatusCode::UnrecognizedEntity,
            553 => StatusCode::InvalidConfigValue,
            554 => StatusCode::InvalidDescriptor,
            555 => StatusCode::UnmanagedEntity,
            650 => StatusCode::AsyncEvent,
            _ => StatusCode::Unknown,
        }
    }

    /// Check if this status code indicates success.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StatusCode::Ok | StatusCode::OperationUnnecessary | StatusCode::ResourceExhaustedInfo
        )
    }

    /// Check if this status code indicates an error.
    pub fn is_error(&self) -> bool {
        !self.is_success() && *self != StatusCode::AsyncEvent
    }

    /// Get the numeric value of this status code.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}
