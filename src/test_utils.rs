//! # Test Utilities
//!
//! Reply builders, canned control-port lines, and a scripted in-memory
//! control port for exercising a session without a running daemon.
//!
//! Enable this module with the `test-utils` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tor-circuit-monitor = { version = "0.1", features = ["test-utils"] }
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tor_circuit_monitor::test_utils::{MockControlPort, MockTorResponse};
//! use tor_circuit_monitor::{Controller, ControllerConfig};
//!
//! #[tokio::test]
//! async fn test_with_mock_port() {
//!     let (stream, mut port) = MockControlPort::pair();
//!     let (handle, _events) = Controller::with_stream(stream, ControllerConfig::new());
//!
//!     let startup = tokio::spawn(async move { handle.run_startup_sequence().await });
//!     port.expect("AUTHENTICATE").await;
//!     port.reply(&MockTorResponse::ok()).await;
//!     // ...
//! }
//! ```

/// Canned control-port lines.
pub mod fixtures {
    use crate::types::{CircuitId, StreamId};

    /// `STATUS_CLIENT` bootstrap notification.
    pub fn bootstrap_event(progress: u8) -> String {
        format!(
            "650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS={} TAG=conn SUMMARY=\"Connecting to a relay\"",
            progress
        )
    }

    /// `STREAM` notification.
    pub fn stream_event(stream: StreamId, status: &str, circuit: CircuitId, target: &str) -> String {
        format!("650 STREAM {} {} {} {}", stream, status, circuit, target)
    }

    /// One `circuit-status` line for a built circuit.
    pub fn built_circuit(id: CircuitId, path: &str, isolation: Option<&str>) -> String {
        let mut line = format!("{} BUILT {} BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL", id, path);
        if let Some(identity) = isolation {
            line.push_str(&format!(" SOCKS_USERNAME=\"{}\" SOCKS_PASSWORD=\"x\"", identity));
        }
        line
    }

    /// A relay's network-status entry.
    pub fn ns_entry(ipv4: &str, ipv6: Option<&str>) -> Vec<String> {
        let mut lines = vec![format!(
            "r relay lpXfw1/+uGEym58asExGOXAgzjE 4Jp5B9cQJNbKT3C8jQH0gHQ9CFE 2024-05-01 12:00:00 {} 9001 0",
            ipv4
        )];
        if let Some(v6) = ipv6 {
            lines.push(format!("a [{}]:9001", v6));
        }
        lines.push("s Fast Guard Running Stable Valid".to_string());
        lines.push("w Bandwidth=2000".to_string());
        lines
    }
}

/// Mock Tor control protocol response builder.
///
/// Helps construct properly formatted control protocol replies.
#[derive(Debug, Clone, Default)]
pub struct MockTorResponse {
    lines: Vec<String>,
}

impl MockTorResponse {
    /// Create a new empty response builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a simple OK response.
    pub fn ok() -> Self {
        Self::new().finish()
    }

    /// Create an error response.
    pub fn error(code: u16, message: &str) -> Self {
        Self {
            lines: vec![format!("{} {}", code, message)],
        }
    }

    /// Answer `GETINFO key` with a single value.
    pub fn value(key: &str, value: &str) -> Self {
        Self::new().data_line(&format!("{}={}", key, value)).finish()
    }

    /// Answer `GETINFO key` with a data block.
    pub fn block<S: AsRef<str>>(key: &str, body: &[S]) -> Self {
        let mut response = Self {
            lines: vec![format!("250+{}=", key)],
        };
        for line in body {
            let line = line.as_ref();
            if line.starts_with('.') {
                response.lines.push(format!(".{}", line));
            } else {
                response.lines.push(line.to_string());
            }
        }
        response.lines.push(".".to_string());
        response.finish()
    }

    /// An asynchronous notification.
    pub fn event(text: &str) -> Self {
        Self {
            lines: vec![format!("650 {}", text)],
        }
    }

    /// Add a mid-reply line (`250-...`).
    pub fn data_line(mut self, line: &str) -> Self {
        self.lines.push(format!("250-{}", line));
        self
    }

    /// Add the final OK line.
    pub fn finish(mut self) -> Self {
        self.lines.push("250 OK".to_string());
        self
    }

    /// Build the response as a string.
    pub fn build(&self) -> String {
        self.lines.iter().map(|l| format!("{}\r\n", l)).collect()
    }

    /// Build the response as bytes.
    pub fn as_bytes(&self) -> Vec<u8> {
        self.build().into_bytes()
    }
}

#[cfg(feature = "tokio-runtime")]
pub use port::MockControlPort;

#[cfg(feature = "tokio-runtime")]
mod port {
    use super::MockTorResponse;
    use std::time::Duration;
    use tokio::io::{
        duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
    };
    use tokio::time::timeout;

    const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

    /// The daemon's end of an in-memory control connection.
    ///
    /// Every helper panics on timeout or on an unexpected command, which
    /// is what a test wants.
    pub struct MockControlPort {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl MockControlPort {
        /// Create a connected pair: the stream to hand to the controller
        /// and the scripted port.
        pub fn pair() -> (DuplexStream, MockControlPort) {
            let (client, server) = duplex(64 * 1024);
            let (read_half, write_half) = tokio::io::split(server);
            let port = MockControlPort {
                reader: BufReader::new(read_half),
                writer: write_half,
            };
            (client, port)
        }

        /// Next command without its line ending, `None` once the
        /// controller closed the connection.
        pub async fn read_command(&mut self) -> Option<String> {
            let mut line = String::new();
            let n = timeout(COMMAND_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a command")
                .ok()?;
            if n == 0 {
                return None;
            }
            Some(line.trim_end_matches(['\r', '\n']).to_string())
        }

        /// Assert that the next command is `expected`.
        pub async fn expect(&mut self, expected: &str) {
            let command = self.read_command().await;
            assert_eq!(command.as_deref(), Some(expected));
        }

        /// Assert that the controller closed the connection.
        pub async fn expect_closed(&mut self) {
            let command = self.read_command().await;
            assert_eq!(command, None);
        }

        /// Send a reply.
        pub async fn reply(&mut self, response: &MockTorResponse) {
            self.send_raw(&response.build()).await;
        }

        /// Send a notification (without the `650 ` prefix).
        pub async fn notify(&mut self, text: &str) {
            self.reply(&MockTorResponse::event(text)).await;
        }

        /// Send raw text.
        pub async fn send_raw(&mut self, text: &str) {
            self.writer
                .write_all(text.as_bytes())
                .await
                .expect("controller went away");
            self.writer.flush().await.expect("controller went away");
        }

        /// Answer `command` with `response` after checking it arrived.
        pub async fn respond(&mut self, command: &str, response: &MockTorResponse) {
            self.expect(command).await;
            self.reply(response).await;
        }

        /// Play the daemon's side of a successful startup with password
        /// `password` and the default event list. The bootstrap phase
        /// query is answered with `bootstrap`, or as unknown.
        pub async fn accept_startup(&mut self, password: &str, bootstrap: Option<u8>) {
            let ok = MockTorResponse::ok();
            self.respond(&format!("AUTHENTICATE \"{}\"", password), &ok)
                .await;
            self.respond("TAKEOWNERSHIP", &ok).await;
            self.respond("RESETCONF __OwningControllerProcess", &ok).await;
            self.respond("SETEVENTS STATUS_CLIENT NOTICE WARN ERR", &ok)
                .await;

            let phase = match bootstrap {
                Some(progress) => MockTorResponse::value(
                    "status/bootstrap-phase",
                    &format!("NOTICE BOOTSTRAP PROGRESS={} TAG=done SUMMARY=\"Done\"", progress),
                ),
                None => MockTorResponse::error(552, "Unrecognized key \"status/bootstrap-phase\""),
            };
            self.respond("GETINFO status/bootstrap-phase", &phase).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_response_ok() {
        assert_eq!(MockTorResponse::ok().build(), "250 OK\r\n");
    }

    #[test]
    fn test_mock_response_with_data() {
        let response = MockTorResponse::new()
            .data_line("version=0.4.8.12")
            .data_line("config-file=/etc/tor/torrc")
            .finish();

        let expected = "250-version=0.4.8.12\r\n250-config-file=/etc/tor/torrc\r\n250 OK\r\n";
        assert_eq!(response.build(), expected);
    }

    #[test]
    fn test_mock_response_block_escapes_dots() {
        let response = MockTorResponse::block("k", &["a", ".b"]);
        assert_eq!(response.build(), "250+k=\r\na\r\n..b\r\n.\r\n250 OK\r\n");
    }

    #[test]
    fn test_mock_response_error() {
        let response = MockTorResponse::error(552, "Unknown option");
        assert_eq!(response.build(), "552 Unknown option\r\n");
    }

    #[test]
    fn test_fixtures_parse() {
        use crate::circuits::{parse_descriptor, CircuitRecord};
        use crate::types::CircuitId;

        let line = fixtures::built_circuit(CircuitId(3), "$AAAA~a", Some("ctx 1"));
        let record = CircuitRecord::parse(&line).unwrap();
        assert_eq!(record.isolation.as_deref(), Some("ctx 1"));

        let (v4, v6) = parse_descriptor(&fixtures::ns_entry("192.0.2.1", Some("2001:db8::1")));
        assert!(v4.is_some());
        assert!(v6.is_some());
    }
}
