//! Example: Follow a Tor daemon and the circuits it builds
//!
//! Takes ownership of the daemon (it exits when this program does), waits
//! for bootstrap, then prints every circuit that serves an isolation
//! identity.
//!
//! Run with:
//! `TOR_PASSWORD=secret RUST_LOG=tor_circuit_monitor=debug cargo run --example monitor -- 127.0.0.1:9051 my-identity`

use tor_circuit_monitor::{
    ConnectionAddress, Controller, ControllerConfig, HostEvent, RelayGeo, Result,
};
use tracing_subscriber::EnvFilter;

fn describe(relay: &RelayGeo) -> String {
    let addr = match (relay.ipv4, relay.ipv6) {
        (Some(v4), _) => v4.to_string(),
        (None, Some(v6)) => v6.to_string(),
        (None, None) => "?".to_string(),
    };
    format!("{} [{}]", addr, relay.country.as_deref().unwrap_or("??"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let address = ConnectionAddress::parse(&args.next().unwrap_or_else(|| "127.0.0.1:9051".into()))?;
    let identity = args.next();
    let password = std::env::var("TOR_PASSWORD").unwrap_or_default();

    println!("Connecting to {}...", address);
    let config = ControllerConfig::new().address(address).password(password);
    let (handle, mut events) = Controller::connect(config).await?;
    handle.run_startup_sequence().await?;
    println!("Controller ready, waiting for bootstrap (Ctrl+C to exit)...");

    if let Some(identity) = identity {
        handle.request_circuit_info(identity)?;
    }

    while let Some(event) = events.recv().await {
        match event {
            HostEvent::BootstrapProgress(state) => println!("[BOOTSTRAP] {}", state),
            HostEvent::CircuitReady(ready) => {
                let path: Vec<String> = ready.relays.iter().map(describe).collect();
                println!("[CIRCUIT] {} -> {}", ready.isolation, path.join(" -> "));
            }
            HostEvent::TorLog(log) => println!("[LOG:{}] {}", log.severity.as_str(), log.message),
            HostEvent::StateChanged(state) => println!("[STATE] {}", state),
            HostEvent::Failure(e) => {
                eprintln!("[FAILURE] {}", e);
                break;
            }
            HostEvent::Terminated => {
                println!("[TERMINATED]");
                break;
            }
        }
    }

    Ok(())
}
