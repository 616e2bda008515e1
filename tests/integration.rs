//! Integration tests against a real Tor instance.
//!
//! These tests require a running Tor instance with the control port
//! enabled and a `HashedControlPassword` set.
//!
//! # Running the tests
//!
//! ```sh
//! tor --ControlPort 9051 --HashedControlPassword "$(tor --hash-password test | tail -1)"
//! cargo test --test integration -- --ignored
//! ```
//!
//! The startup tests take ownership of the daemon: Tor exits when the test
//! closes its connection. Run them last, against a throwaway instance.
//!
//! # Test Configuration
//!
//! By default, tests connect to 127.0.0.1:9051 with password `test`.
//! Set `TOR_CONTROL_PORT` and `TOR_PASSWORD` to override.

use std::time::Duration;
use tokio::time::timeout;
use tor_circuit_monitor::auth::{authenticate, AuthCredential};
use tor_circuit_monitor::circuits::{enumerate_circuits, lookup_relay};
use tor_circuit_monitor::{
    BootstrapState, CircuitStatus, ConnectionAddress, ControlError, Controller, ControllerConfig,
    ControllerHandle, HostEvent, HostEvents, SessionState,
};

/// Default timeout for operations
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

fn control_addr() -> ConnectionAddress {
    let addr = std::env::var("TOR_CONTROL_PORT").unwrap_or_else(|_| "127.0.0.1:9051".to_string());
    ConnectionAddress::parse(&addr).expect("TOR_CONTROL_PORT must be host:port or unix:/path")
}

fn password() -> String {
    std::env::var("TOR_PASSWORD").unwrap_or_else(|_| "test".to_string())
}

fn config() -> ControllerConfig {
    ControllerConfig::new()
        .address(control_addr())
        .password(password())
}

async fn session() -> (ControllerHandle, HostEvents) {
    timeout(TEST_TIMEOUT, Controller::connect(config()))
        .await
        .expect("connect timed out")
        .expect("should connect to Tor")
}

/// A session that authenticated without taking ownership.
async fn authenticated_session() -> (ControllerHandle, HostEvents) {
    let (handle, events) = session().await;
    authenticate(handle.commands(), &AuthCredential::password(password()))
        .await
        .expect("authentication should succeed");
    (handle, events)
}

// ============================================================================
// Connection Tests
// ============================================================================

mod connection {
    use super::*;

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let config = ControllerConfig::new().address(ConnectionAddress::parse("127.0.0.1:1").unwrap());
        let result = Controller::connect(config).await;
        assert!(matches!(result, Err(ControlError::ConnectionFailed(_))));
    }

    #[tokio::test]
    #[ignore = "Requires a running Tor instance"]
    async fn test_connect() {
        let (handle, _events) = session().await;
        assert!(!handle.state().is_finished());
        handle.terminate().await;
        assert_eq!(handle.state(), SessionState::Closed);
    }
}

// ============================================================================
// Lookup Tests
// ============================================================================

mod lookups {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires a running Tor instance"]
    async fn test_enumerate_circuits() {
        let (handle, _events) = authenticated_session().await;
        let circuits = timeout(TEST_TIMEOUT, enumerate_circuits(handle.commands()))
            .await
            .unwrap()
            .unwrap();
        for circuit in &circuits {
            println!("Circuit {} {} {}", circuit.id, circuit.status, circuit.path);
        }
        handle.terminate().await;
    }

    #[tokio::test]
    #[ignore = "Requires a running Tor instance"]
    async fn test_lookup_first_relay() {
        let (handle, _events) = authenticated_session().await;
        let circuits = enumerate_circuits(handle.commands()).await.unwrap();

        let Some(built) = circuits.iter().find(|c| c.status == CircuitStatus::Built) else {
            println!("Skipping: no built circuit");
            return;
        };
        let fingerprints = tor_circuit_monitor::types::path_fingerprints(&built.path);
        let relay = timeout(TEST_TIMEOUT, lookup_relay(handle.commands(), &fingerprints[0]))
            .await
            .unwrap()
            .unwrap();
        assert!(relay.ipv4.is_some() || relay.ipv6.is_some());
        println!("Relay {}: {:?}", fingerprints[0], relay);
        handle.terminate().await;
    }
}

// ============================================================================
// Session Tests
// ============================================================================

mod startup {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires a running Tor instance"]
    async fn test_wrong_password_fails() {
        let config = config().password("definitely-not-the-password");
        let (handle, mut events) = Controller::connect(config).await.unwrap();

        let result = handle.run_startup_sequence().await;
        assert!(matches!(result, Err(ControlError::AuthenticationRejected(_))));

        let mut failures = 0;
        while let Some(event) = timeout(TEST_TIMEOUT, events.recv()).await.unwrap() {
            match event {
                HostEvent::Failure(_) => failures += 1,
                HostEvent::Terminated => panic!("rejection must not report termination"),
                _ => {}
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    #[ignore = "Requires a throwaway Tor instance: it exits when the test ends"]
    async fn test_startup_reaches_ready() {
        let (handle, mut events) = session().await;
        timeout(TEST_TIMEOUT, handle.run_startup_sequence())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), SessionState::Ready);

        // A running daemon reports its current phase right after startup.
        let progress = timeout(TEST_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if let HostEvent::BootstrapProgress(state) = event {
                    return Some(state);
                }
            }
            None
        })
        .await
        .unwrap();
        assert!(matches!(progress, Some(BootstrapState::Progress(_))));

        handle.terminate().await;
    }
}
