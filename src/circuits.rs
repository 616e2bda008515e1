//! Circuit tracking and relay resolution.
//!
//! The session keeps a list of built circuits. A refresh enumerates the
//! daemon's circuits, keeps the built ones, and reconciles them by id
//! with what is already known so resolved relays are never looked up
//! twice. New circuits that carry an isolation identity get their path
//! resolved: each relay's descriptor gives its addresses, and each address
//! is mapped to a country.

use crate::protocol::{tokenize, unquote};
use crate::types::*;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use tracing::{debug, trace};

/// One line of `GETINFO circuit-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    /// Circuit ID.
    pub id: CircuitId,
    /// Circuit status.
    pub status: CircuitStatus,
    /// Comma-separated relay path, empty if the circuit has no hops yet.
    pub path: String,
    /// Unquoted `SOCKS_USERNAME`, if present.
    pub isolation: Option<String>,
}

impl CircuitRecord {
    /// Parse `<id> <status> [<path>] [KEY=VALUE ...]`.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens = tokenize(line);
        let id = CircuitId::from_str(tokens.first()?).ok()?;
        let status = CircuitStatus::from_str(tokens.get(1)?).unwrap_or(CircuitStatus::Unknown);

        let path = tokens
            .get(2)
            .filter(|t| t.starts_with('$') || !t.contains('='))
            .map(|t| t.to_string())
            .unwrap_or_default();

        let isolation = tokens
            .iter()
            .skip(2)
            .find_map(|t| t.strip_prefix("SOCKS_USERNAME="))
            .map(unquote);

        Some(Self {
            id,
            status,
            path,
            isolation,
        })
    }
}

/// Parse every circuit in a `circuit-status` reply, skipping bad lines.
pub fn parse_circuit_status(lines: &[String]) -> Vec<CircuitRecord> {
    lines
        .iter()
        .filter_map(|line| {
            let record = CircuitRecord::parse(line);
            if record.is_none() {
                debug!("Skipping unparsable circuit line: {}", line);
            }
            record
        })
        .collect()
}

/// Pull the relay's addresses out of its network-status entry.
///
/// The `r` line carries the IPv4 address in its seventh field; an `a`
/// line, when present, carries `[ipv6]:port`.
pub fn parse_descriptor(lines: &[String]) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
    let mut ipv4 = None;
    let mut ipv6 = None;

    for line in lines {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("r") if ipv4.is_none() => {
                ipv4 = fields.nth(5).and_then(|ip| ip.parse().ok());
            }
            Some("a") if ipv6.is_none() => {
                ipv6 = fields
                    .next()
                    .and_then(|addr| addr.strip_prefix('['))
                    .and_then(|addr| addr.split(']').next())
                    .and_then(|ip| ip.parse().ok());
            }
            _ => {}
        }
    }

    (ipv4, ipv6)
}

/// Country code from an `ip-to-country` reply; `??` means unknown.
pub fn parse_country(lines: &[String]) -> Option<String> {
    let code = lines.first()?.trim();
    if code.is_empty() || code == "??" {
        None
    } else {
        Some(code.to_lowercase())
    }
}

/// Known built circuits plus refresh bookkeeping.
#[derive(Debug, Default)]
pub struct CircuitTracker {
    circuits: Vec<Circuit>,
    refreshing: bool,
    stale: bool,
}

impl CircuitTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// All known circuits.
    pub fn circuits(&self) -> &[Circuit] {
        &self.circuits
    }

    /// Whether a circuit with this id is known.
    pub fn contains(&self, id: CircuitId) -> bool {
        self.circuits.iter().any(|c| c.id == id)
    }

    /// The circuit isolated on `identity`, if any.
    pub fn find_by_isolation(&self, identity: &str) -> Option<&Circuit> {
        self.circuits
            .iter()
            .find(|c| c.isolation.as_deref() == Some(identity))
    }

    /// Claim the right to enumerate.
    ///
    /// Returns `false` if an enumeration is already running; the tracker
    /// then remembers to run one more after it.
    pub fn begin_refresh(&mut self) -> bool {
        if self.refreshing {
            self.stale = true;
            return false;
        }
        self.refreshing = true;
        true
    }

    /// Release the enumeration claim. Returns `true` if another refresh
    /// was requested meanwhile (the claim is then kept).
    pub fn end_refresh(&mut self) -> bool {
        if self.stale {
            self.stale = false;
            return true;
        }
        self.refreshing = false;
        false
    }

    /// Replace the known list with the built circuits in `records`.
    ///
    /// Circuits already known keep their resolved relays. Returns the id
    /// and path of every new circuit that needs resolving.
    pub fn reconcile(&mut self, records: Vec<CircuitRecord>) -> Vec<(CircuitId, String)> {
        let mut previous = std::mem::take(&mut self.circuits);
        let mut to_resolve = Vec::new();

        for record in records {
            if record.status != CircuitStatus::Built || self.contains(record.id) {
                continue;
            }

            if let Some(pos) = previous.iter().position(|c| c.id == record.id) {
                self.circuits.push(previous.swap_remove(pos));
                continue;
            }

            trace!("New built circuit {}", record.id);
            if record.isolation.is_some() {
                to_resolve.push((record.id, record.path));
            }
            self.circuits.push(Circuit {
                id: record.id,
                isolation: record.isolation,
                relays: Vec::new(),
            });
        }

        for gone in previous {
            trace!("Circuit {} is gone", gone.id);
        }
        to_resolve
    }

    /// Attach resolved relays to a circuit.
    ///
    /// Returns the circuit if it still exists and had no relays yet.
    pub fn attach(&mut self, id: CircuitId, relays: Vec<RelayGeo>) -> Option<&Circuit> {
        let circuit = self.circuits.iter_mut().find(|c| c.id == id)?;
        if !circuit.relays.is_empty() {
            return None;
        }
        circuit.relays = relays;
        Some(circuit)
    }
}

#[cfg(feature = "tokio-runtime")]
pub use lookup::{enumerate_circuits, lookup_country, lookup_relay, resolve_path};

#[cfg(feature = "tokio-runtime")]
mod lookup {
    use super::*;
    use crate::error::{ControlError, Result};
    use crate::multiline::InfoQuery;
    use crate::pipeline::CommandSender;
    use std::net::IpAddr;

    async fn get_info(commands: &CommandSender, key: String) -> Result<Vec<String>> {
        let query = InfoQuery::new(key);
        let command = query.command();
        commands.submit(command, query).await
    }

    /// Like [`get_info`], but a rejected query reads as a miss.
    async fn lookup(commands: &CommandSender, key: String) -> Result<Vec<String>> {
        match get_info(commands, key).await {
            Err(ControlError::CommandRejected { code, message }) => {
                debug!("Lookup rejected ({} {}); treating as unknown", code, message);
                Ok(Vec::new())
            }
            other => other,
        }
    }

    /// Enumerate the daemon's circuits.
    pub async fn enumerate_circuits(commands: &CommandSender) -> Result<Vec<CircuitRecord>> {
        let lines = get_info(commands, "circuit-status".to_string()).await?;
        Ok(parse_circuit_status(&lines))
    }

    /// Map an address to its country code.
    ///
    /// A daemon without GeoIP data for the address family rejects the
    /// query; that reads as an unknown country.
    pub async fn lookup_country(commands: &CommandSender, addr: IpAddr) -> Result<Option<String>> {
        let lines = lookup(commands, format!("ip-to-country/{}", addr)).await?;
        Ok(parse_country(&lines))
    }

    /// Resolve one relay's addresses and country.
    ///
    /// Only transport errors fail; a missing or rejected descriptor gives a
    /// relay with no addresses and no country lookup.
    pub async fn lookup_relay(commands: &CommandSender, fingerprint: &Fingerprint) -> Result<RelayGeo> {
        let lines = lookup(commands, format!("ns/id/{}", fingerprint)).await?;
        let (ipv4, ipv6) = parse_descriptor(&lines);

        let mut country = None;
        if let Some(v4) = ipv4 {
            country = lookup_country(commands, IpAddr::V4(v4)).await?;
        }
        if let Some(v6) = ipv6 {
            let v6_country = lookup_country(commands, IpAddr::V6(v6)).await?;
            country = country.or(v6_country);
        }

        trace!("Relay {} resolved: {:?} {:?} {:?}", fingerprint, ipv4, ipv6, country);
        Ok(RelayGeo {
            ipv4,
            ipv6,
            country,
        })
    }

    /// Resolve every relay of a path, one lookup at a time, in path order.
    pub async fn resolve_path(commands: &CommandSender, path: &str) -> Result<Vec<RelayGeo>> {
        let mut relays = Vec::new();
        for fingerprint in path_fingerprints(path) {
            relays.push(lookup_relay(commands, &fingerprint).await?);
        }
        Ok(relays)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn record(id: u64, status: CircuitStatus, isolation: Option<&str>) -> CircuitRecord {
        CircuitRecord {
            id: CircuitId(id),
            status,
            path: format!("$A{id}~a,$B{id}~b"),
            isolation: isolation.map(String::from),
        }
    }

    #[test]
    fn test_parse_minimal_record() {
        let record = CircuitRecord::parse("10 BUILT $AAAA~n").unwrap();
        assert_eq!(record.id, CircuitId(10));
        assert_eq!(record.status, CircuitStatus::Built);
        assert_eq!(record.path, "$AAAA~n");
        assert_eq!(record.isolation, None);
    }

    #[test]
    fn test_parse_record_with_isolation() {
        let record = CircuitRecord::parse(
            r#"7 BUILT $AAAA~guard,$BBBB~exit BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL SOCKS_USERNAME="firefox container 1" SOCKS_PASSWORD="x""#,
        )
        .unwrap();
        assert_eq!(record.path, "$AAAA~guard,$BBBB~exit");
        assert_eq!(record.isolation.as_deref(), Some("firefox container 1"));
    }

    #[test]
    fn test_parse_record_without_path() {
        let record = CircuitRecord::parse("3 LAUNCHED BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL").unwrap();
        assert_eq!(record.status, CircuitStatus::Launched);
        assert!(record.path.is_empty());
    }

    #[test]
    fn test_parse_circuit_status_skips_garbage() {
        let records = parse_circuit_status(&lines(&["x BUILT", "4 EXTENDED $A", ""]));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, CircuitId(4));
    }

    #[test]
    fn test_parse_descriptor() {
        let (v4, v6) = parse_descriptor(&lines(&[
            "r relay AAAAAAAAAAAAAAAAAAAAAAAAAAA BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-01-01 00:00:00 192.0.2.7 9001 0",
            "a [2001:db8::7]:9001",
            "s Fast Running Stable Valid",
        ]));
        assert_eq!(v4, Some("192.0.2.7".parse().unwrap()));
        assert_eq!(v6, Some("2001:db8::7".parse().unwrap()));
    }

    #[test]
    fn test_parse_descriptor_without_addresses() {
        assert_eq!(parse_descriptor(&lines(&["s Fast"])), (None, None));
        assert_eq!(parse_descriptor(&[]), (None, None));
    }

    #[test]
    fn test_parse_country() {
        assert_eq!(parse_country(&lines(&["DE"])), Some("de".to_string()));
        assert_eq!(parse_country(&lines(&["??"])), None);
        assert_eq!(parse_country(&[]), None);
    }

    #[test]
    fn test_reconcile_keeps_only_built() {
        let mut tracker = CircuitTracker::new();
        let resolve = tracker.reconcile(vec![
            record(1, CircuitStatus::Built, Some("ctx1")),
            record(2, CircuitStatus::Extended, Some("ctx2")),
            record(3, CircuitStatus::Built, None),
        ]);
        assert_eq!(resolve, vec![(CircuitId(1), "$A1~a,$B1~b".to_string())]);
        assert_eq!(tracker.circuits().len(), 2);
        assert!(tracker.contains(CircuitId(3)));
        assert!(!tracker.contains(CircuitId(2)));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut tracker = CircuitTracker::new();
        let snapshot = vec![record(1, CircuitStatus::Built, Some("ctx1"))];

        assert_eq!(tracker.reconcile(snapshot.clone()).len(), 1);
        let relays = vec![RelayGeo {
            country: Some("de".to_string()),
            ..Default::default()
        }];
        assert!(tracker.attach(CircuitId(1), relays.clone()).is_some());

        assert!(tracker.reconcile(snapshot).is_empty());
        assert_eq!(tracker.find_by_isolation("ctx1").unwrap().relays, relays);
    }

    #[test]
    fn test_reconcile_drops_vanished_and_dedups() {
        let mut tracker = CircuitTracker::new();
        tracker.reconcile(vec![
            record(1, CircuitStatus::Built, None),
            record(1, CircuitStatus::Built, None),
        ]);
        assert_eq!(tracker.circuits().len(), 1);

        tracker.reconcile(vec![record(2, CircuitStatus::Built, None)]);
        assert!(!tracker.contains(CircuitId(1)));
        assert!(tracker.contains(CircuitId(2)));
    }

    #[test]
    fn test_attach_to_vanished_circuit() {
        let mut tracker = CircuitTracker::new();
        assert!(tracker.attach(CircuitId(9), vec![RelayGeo::default()]).is_none());
    }

    #[test]
    fn test_refresh_coalescing() {
        let mut tracker = CircuitTracker::new();
        assert!(tracker.begin_refresh());
        assert!(!tracker.begin_refresh());
        assert!(!tracker.begin_refresh());
        assert!(tracker.end_refresh());
        assert!(!tracker.end_refresh());
        assert!(tracker.begin_refresh());
    }
}
