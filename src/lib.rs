//! # tor-circuit-monitor
//!
//! An async controller for a locally running Tor daemon that the host
//! application launched itself.
//!
//! A session authenticates on the control port, takes ownership of the
//! daemon so it exits with the controller, follows bootstrap progress, and
//! once the daemon is ready builds a picture of its circuits: which relays
//! each one uses, and where those relays are. Callers ask for the circuit
//! serving an isolation identity (the SOCKS username a client used) and
//! get its relays' addresses and countries.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tor_circuit_monitor::{generate_password, Controller, ControllerConfig, HostEvent};
//!
//! #[tokio::main]
//! async fn main() -> tor_circuit_monitor::Result<()> {
//!     // Launch tor with a HashedControlPassword derived from this.
//!     let password = generate_password();
//!
//!     let config = ControllerConfig::new().password(password);
//!     let (handle, mut events) = Controller::connect(config).await?;
//!     handle.run_startup_sequence().await?;
//!     handle.request_circuit_info("firefox-container-1")?;
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             HostEvent::BootstrapProgress(state) => println!("bootstrap {}", state),
//!             HostEvent::CircuitReady(ready) => println!("{:?}", ready),
//!             HostEvent::Terminated => break,
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Wire Model
//!
//! Replies on the control port are not tagged: the n-th reply answers the
//! n-th command. Every command therefore goes through one
//! [`pipeline::CommandPipeline`] that keeps a single command in flight,
//! and lines no command claims are treated as asynchronous notifications.
//!
//! ## Feature Flags
//!
//! - `tokio-runtime` (default): the connection and session tasks. Without
//!   it only the parsers and trackers are built.
//! - `test-utils`: reply builders and a scripted in-memory control port.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod auth;
pub mod bootstrap;
pub mod circuits;
pub mod config;
pub mod error;
pub mod events;
pub mod gate;
pub mod multiline;
pub mod pipeline;
pub mod protocol;
pub mod types;

#[cfg(feature = "tokio-runtime")]
mod connection;

#[cfg(feature = "tokio-runtime")]
pub mod session;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{ControlError, Rejection, Result};

#[cfg(feature = "tokio-runtime")]
pub use pipeline::CommandSender;
#[cfg(feature = "tokio-runtime")]
pub use session::{Controller, ControllerHandle, HostEvent, HostEvents, SessionState};

pub use auth::{generate_password, AuthCredential};
pub use bootstrap::BootstrapTracker;
pub use circuits::{CircuitRecord, CircuitTracker};
pub use config::{ConnectionAddress, ControllerConfig};
pub use events::{Event, EventType, LogEvent, LogSeverity};
pub use gate::ReadinessGate;
pub use types::{
    BootstrapState, Circuit, CircuitId, CircuitReady, CircuitStatus, Fingerprint, RelayGeo,
    StreamId, StreamStatus,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
