//! Core types shared by the trackers.
//!
//! Identifiers and status tokens as they appear on the wire, plus the
//! circuit model the session builds for display.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A circuit identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CircuitId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CircuitId(s.parse()?))
    }
}

/// A stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StreamId(s.parse()?))
    }
}

/// A relay fingerprint, stored without the `$` marker and upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Create a new Fingerprint from a hex string.
    pub fn new(fingerprint: impl Into<String>) -> Self {
        let fp = fingerprint.into();
        let fp = fp.strip_prefix('$').unwrap_or(&fp);
        Fingerprint(fp.to_uppercase())
    }

    /// Extract the fingerprint from one hop of a circuit path.
    ///
    /// Hops look like `$FP`, `$FP~nickname` or `$FP=nickname`. Returns
    /// `None` for an empty hop.
    pub fn from_path_token(token: &str) -> Option<Self> {
        let bare = token.trim().trim_start_matches('$');
        let bare = bare.split(['~', '=']).next().unwrap_or("");
        if bare.is_empty() {
            None
        } else {
            Some(Fingerprint::new(bare))
        }
    }

    /// Get the fingerprint as a string (without $ prefix).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Split a comma-separated circuit path into relay fingerprints.
pub fn path_fingerprints(path: &str) -> Vec<Fingerprint> {
    path.split(',').filter_map(Fingerprint::from_path_token).collect()
}

/// Status of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Circuit ID assigned to new circuit.
    Launched,
    /// All hops finished, can now accept streams.
    Built,
    /// All hops finished, waiting to see if a circuit with a better guard will be usable.
    GuardWait,
    /// One more hop has been completed.
    Extended,
    /// Circuit closed (was not built).
    Failed,
    /// Circuit closed (was built).
    Closed,
    /// Unknown status.
    Unknown,
}

impl FromStr for CircuitStatus {
    type Err = crate::error::ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_uppercase().as_str() {
            "LAUNCHED" => CircuitStatus::Launched,
            "BUILT" => CircuitStatus::Built,
            "GUARD_WAIT" => CircuitStatus::GuardWait,
            "EXTENDED" => CircuitStatus::Extended,
            "FAILED" => CircuitStatus::Failed,
            "CLOSED" => CircuitStatus::Closed,
            _ => CircuitStatus::Unknown,
        })
    }
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitStatus::Launched => "LAUNCHED",
            CircuitStatus::Built => "BUILT",
            CircuitStatus::GuardWait => "GUARD_WAIT",
            CircuitStatus::Extended => "EXTENDED",
            CircuitStatus::Failed => "FAILED",
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// Status of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStatus {
    /// New request to connect.
    New,
    /// New request to resolve an address.
    NewResolve,
    /// Address re-mapped to another.
    Remap,
    /// Sent a connect message along a circuit.
    SentConnect,
    /// Sent a resolve message along a circuit.
    SentResolve,
    /// Received a reply; stream established.
    Succeeded,
    /// Stream failed and not retriable.
    Failed,
    /// Stream closed.
    Closed,
    /// Detached from circuit; still retriable.
    Detached,
    /// Waiting for controller to use ATTACHSTREAM.
    ControllerWait,
    /// Unknown status.
    Unknown,
}

impl StreamStatus {
    /// Whether the stream is attempting to connect over its circuit.
    pub fn is_connect_attempt(&self) -> bool {
        *self == StreamStatus::SentConnect
    }
}

impl FromStr for StreamStatus {
    type Err = crate::error::ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_uppercase().as_str() {
            "NEW" => StreamStatus::New,
            "NEWRESOLVE" => StreamStatus::NewResolve,
            "REMAP" => StreamStatus::Remap,
            "SENTCONNECT" => StreamStatus::SentConnect,
            "SENTRESOLVE" => StreamStatus::SentResolve,
            "SUCCEEDED" => StreamStatus::Succeeded,
            "FAILED" => StreamStatus::Failed,
            "CLOSED" => StreamStatus::Closed,
            "DETACHED" => StreamStatus::Detached,
            "CONTROLLER_WAIT" => StreamStatus::ControllerWait,
            _ => StreamStatus::Unknown,
        })
    }
}

/// Startup progress of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Percentage reported so far (0-100).
    Progress(u8),
    /// The daemon ran out of resources; no further progress is accepted.
    Exhausted,
}

impl BootstrapState {
    /// Whether bootstrap reached 100%.
    pub fn is_complete(&self) -> bool {
        *self == BootstrapState::Progress(100)
    }
}

impl Default for BootstrapState {
    fn default() -> Self {
        BootstrapState::Progress(0)
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Progress(pct) => write!(f, "{}%", pct),
            BootstrapState::Exhausted => write!(f, "out of memory"),
        }
    }
}

/// Where a relay lives, as far as the daemon knows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayGeo {
    /// IPv4 address from the relay's router line.
    pub ipv4: Option<Ipv4Addr>,
    /// IPv6 address from the relay's `a` line.
    pub ipv6: Option<Ipv6Addr>,
    /// Two-letter country code.
    pub country: Option<String>,
}

/// A built circuit as tracked by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// Circuit ID.
    pub id: CircuitId,
    /// SOCKS username the circuit is isolated on, if any.
    pub isolation: Option<String>,
    /// Relays in path order, empty until resolved.
    pub relays: Vec<RelayGeo>,
}

/// Geo data for the circuit serving one isolation identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitReady {
    /// Isolation identity of the circuit.
    pub isolation: String,
    /// Relays in path order.
    pub relays: Vec<RelayGeo>,
}
