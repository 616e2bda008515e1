//! The controller session.
//!
//! A session is a single task that owns all session state: the lifecycle
//! state, the bootstrap tracker, the readiness gate and the known
//! circuits. It listens to three sources:
//!
//! - the connection task (notifications, rejections, close),
//! - requests from [`ControllerHandle`]s,
//! - results from its own short-lived worker tasks.
//!
//! Workers run the multi-step conversations (startup, enumeration,
//! relay resolution) through the command pipeline and report back as
//! messages, so the session itself never waits on the wire and nothing it
//! owns needs a lock.

use crate::auth;
use crate::bootstrap::{BootstrapTracker, Transition};
use crate::circuits::{enumerate_circuits, resolve_path, CircuitRecord, CircuitTracker};
use crate::config::{ConnectionAddress, ControllerConfig};
use crate::connection::{self, Inbound};
use crate::error::{ControlError, Rejection, Result};
use crate::events::{event_names, parse_event, Event, LogEvent, LogSeverity, StreamEvent};
use crate::gate::ReadinessGate;
use crate::multiline::InfoQuery;
use crate::pipeline::CommandSender;
use crate::protocol::format_command;
use crate::types::{BootstrapState, CircuitId, CircuitReady, RelayGeo};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not open yet.
    Connecting,
    /// Transport open.
    Connected,
    /// The credential was accepted.
    Authenticated,
    /// The daemon's lifetime is tied to this connection.
    Owned,
    /// Status notifications are subscribed.
    Subscribed,
    /// Startup finished.
    Ready,
    /// A command was rejected; the session is over.
    Failed,
    /// The transport closed or the session was terminated.
    Closed,
}

impl SessionState {
    /// Whether the session is over.
    pub fn is_finished(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticated => "authenticated",
            SessionState::Owned => "owned",
            SessionState::Subscribed => "subscribed",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// What the session tells its host.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The lifecycle state changed.
    StateChanged(SessionState),
    /// Bootstrap progressed, or the daemon ran out of resources.
    BootstrapProgress(BootstrapState),
    /// Geo data for an isolation identity's circuit.
    CircuitReady(CircuitReady),
    /// A log line from the daemon.
    TorLog(LogEvent),
    /// The daemon rejected a command. Reported once; the session closes.
    Failure(ControlError),
    /// The transport closed or the session was terminated. Reported once.
    Terminated,
}

/// Receiver for [`HostEvent`]s.
///
/// Yields `None` once the session is over and every event was delivered.
#[derive(Debug)]
pub struct HostEvents {
    rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl HostEvents {
    /// Wait for the next event.
    pub async fn recv(&mut self) -> Option<HostEvent> {
        self.rx.recv().await
    }

    /// Take an event if one is queued.
    pub fn try_recv(&mut self) -> Option<HostEvent> {
        self.rx.try_recv().ok()
    }
}

enum Request {
    Startup(oneshot::Sender<Result<()>>),
    CircuitInfo(String),
    Exhausted,
    Terminate,
}

enum Internal {
    Advanced(SessionState),
    StartupFinished {
        progress: Option<u8>,
        reply: oneshot::Sender<Result<()>>,
    },
    StartupFailed(ControlError),
    Enumerated(Result<Vec<CircuitRecord>>),
    Resolved {
        id: CircuitId,
        relays: Result<Vec<RelayGeo>>,
    },
}

/// Entry points for starting a session.
pub struct Controller;

impl Controller {
    /// Connect to the control port named by `config.address`.
    pub async fn connect(config: ControllerConfig) -> Result<(ControllerHandle, HostEvents)> {
        debug!("Connecting to {}", config.address);
        match config.address.clone() {
            ConnectionAddress::Tcp(addr) => {
                let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| ControlError::Timeout)?
                    .map_err(|e| ControlError::ConnectionFailed(format!("{}: {}", addr, e)))?;
                Ok(Self::with_stream(stream, config))
            }
            #[cfg(unix)]
            ConnectionAddress::Unix(path) => {
                let stream = timeout(config.connect_timeout, tokio::net::UnixStream::connect(&path))
                    .await
                    .map_err(|_| ControlError::Timeout)?
                    .map_err(|e| {
                        ControlError::ConnectionFailed(format!("{}: {}", path.display(), e))
                    })?;
                Ok(Self::with_stream(stream, config))
            }
            #[cfg(not(unix))]
            ConnectionAddress::Unix(_) => Err(ControlError::ConfigurationError(
                "Unix sockets are not supported on this platform".to_string(),
            )),
        }
    }

    /// Start a session over an already open stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_stream<S>(stream: S, config: ControllerConfig) -> (ControllerHandle, HostEvents)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = connection::spawn(stream, config.channel_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let session = Session {
            config,
            commands: conn.commands.clone(),
            state: state_tx,
            host: host_tx,
            internal: internal_tx,
            bootstrap: BootstrapTracker::new(),
            gate: ReadinessGate::new(),
            circuits: CircuitTracker::new(),
            startup_requested: false,
        };
        tokio::spawn(session.run(conn.inbound, conn.shutdown, request_rx, internal_rx));

        let handle = ControllerHandle {
            requests: request_tx,
            state: state_rx,
            commands: conn.commands,
        };
        (handle, HostEvents { rx: host_rx })
    }
}

/// Cloneable handle to a running session.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SessionState>,
    commands: CommandSender,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Startup(_) => write!(f, "Startup"),
            Request::CircuitInfo(identity) => write!(f, "CircuitInfo({})", identity),
            Request::Exhausted => write!(f, "Exhausted"),
            Request::Terminate => write!(f, "Terminate"),
        }
    }
}

impl ControllerHandle {
    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| ControlError::ConnectionClosed)
    }

    /// Authenticate, take ownership of the daemon and subscribe to status
    /// notifications, in that order.
    ///
    /// Resolves once the session is [`SessionState::Ready`]. Can only run
    /// once per session.
    pub async fn run_startup_sequence(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Startup(reply))?;
        rx.await.map_err(|_| ControlError::ConnectionClosed)?
    }

    /// Ask for the circuit serving `identity`.
    ///
    /// The answer arrives as [`HostEvent::CircuitReady`]. Before bootstrap
    /// completes the request is parked and retried once it does. If no
    /// circuit carries the identity, nothing is reported.
    pub fn request_circuit_info(&self, identity: impl Into<String>) -> Result<()> {
        self.send(Request::CircuitInfo(identity.into()))
    }

    /// Tell the session the daemon ran out of resources. Bootstrap
    /// progress reported afterwards is ignored.
    pub fn report_resource_exhaustion(&self) -> Result<()> {
        self.send(Request::Exhausted)
    }

    /// Close the session. Idempotent.
    pub async fn terminate(&self) {
        if self.send(Request::Terminate).is_err() {
            return;
        }
        let mut state = self.state.clone();
        // Fails only once the session task is gone.
        let _ = state.wait_for(|s| s.is_finished()).await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The raw command pipeline, for commands the session does not issue
    /// itself.
    pub fn commands(&self) -> &CommandSender {
        &self.commands
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Session {
    config: ControllerConfig,
    commands: CommandSender,
    state: watch::Sender<SessionState>,
    host: mpsc::UnboundedSender<HostEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    bootstrap: BootstrapTracker,
    gate: ReadinessGate<String>,
    circuits: CircuitTracker,
    startup_requested: bool,
}

impl Session {
    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        shutdown: oneshot::Sender<()>,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        self.transition(SessionState::Connected);

        loop {
            // Worker results first: a rejection must be judged against the
            // state the worker already reached.
            let flow = tokio::select! {
                biased;
                Some(message) = internal.recv() => self.on_internal(message),
                message = inbound.recv() => match message {
                    Some(message) => self.on_inbound(message),
                    None => self.on_closed(None),
                },
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request),
                    None => {
                        debug!("Every controller handle dropped");
                        self.on_closed(None)
                    }
                },
            };
            if flow == Flow::Stop {
                break;
            }
        }

        // The connection task may already be gone.
        let _ = shutdown.send(());
        debug!("Session finished in state {}", self.current());
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn emit(&self, event: HostEvent) {
        // The host may have dropped its receiver.
        let _ = self.host.send(event);
    }

    fn transition(&mut self, next: SessionState) {
        if self.current() == next || self.current().is_finished() {
            return;
        }
        debug!("Session state {} -> {}", self.current(), next);
        self.state.send_replace(next);
        self.emit(HostEvent::StateChanged(next));
    }

    fn on_inbound(&mut self, message: Inbound) -> Flow {
        match message {
            Inbound::Event(event) => {
                self.on_event(event);
                Flow::Continue
            }
            Inbound::CommandFailed(rejection) => {
                let error = self.classify(rejection);
                self.on_failure(error)
            }
            Inbound::Closed(reason) => self.on_closed(reason),
        }
    }

    fn classify(&self, rejection: Rejection) -> ControlError {
        let authenticating = matches!(
            self.current(),
            SessionState::Connecting | SessionState::Connected
        );
        if authenticating || rejection.is_authentication() {
            ControlError::AuthenticationRejected(format!("{} {}", rejection.code, rejection.message))
        } else {
            rejection.into()
        }
    }

    fn on_failure(&mut self, error: ControlError) -> Flow {
        warn!("Session failed: {}", error);
        self.transition(SessionState::Failed);
        self.emit(HostEvent::Failure(error));
        Flow::Stop
    }

    fn on_closed(&mut self, reason: Option<ControlError>) -> Flow {
        match reason {
            Some(e) => warn!("Control connection lost: {}", e),
            None => info!("Control connection closed"),
        }
        self.transition(SessionState::Closed);
        self.emit(HostEvent::Terminated);
        Flow::Stop
    }

    fn on_request(&mut self, request: Request) -> Flow {
        trace!("Request {:?}", request);
        match request {
            Request::Startup(reply) => self.start(reply),
            Request::CircuitInfo(identity) => {
                if let Some(identity) = self.gate.admit(identity) {
                    self.serve(&identity);
                } else {
                    debug!("Parking circuit request until bootstrap completes");
                }
            }
            Request::Exhausted => {
                if self.bootstrap.mark_exhausted() == Transition::Exhausted {
                    self.emit(HostEvent::BootstrapProgress(self.bootstrap.state()));
                }
            }
            Request::Terminate => return self.on_closed(None),
        }
        Flow::Continue
    }

    fn on_internal(&mut self, message: Internal) -> Flow {
        match message {
            Internal::Advanced(state) => self.transition(state),
            Internal::StartupFinished { progress, reply } => {
                self.transition(SessionState::Ready);
                info!("Controller ready");
                let _ = reply.send(Ok(()));
                if let Some(progress) = progress {
                    self.on_bootstrap(progress);
                }
            }
            Internal::StartupFailed(error) => {
                // Transport loss is reported by the connection.
                if !error.is_transport() {
                    return self.on_failure(error);
                }
            }
            Internal::Enumerated(result) => self.on_enumerated(result),
            Internal::Resolved { id, relays } => self.on_resolved(id, relays),
        }
        Flow::Continue
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Status(status) => {
                if let Some(progress) = status.bootstrap_progress() {
                    self.on_bootstrap(progress);
                }
            }
            Event::StreamStatus(stream) => self.on_stream(stream),
            Event::Log(log) => self.on_log(log),
            Event::Unknown { event_type, .. } => trace!("Ignoring {} notification", event_type),
        }
    }

    fn on_log(&self, log: LogEvent) {
        match log.severity {
            LogSeverity::Notice => info!(target: "tor", "{}", log.message),
            LogSeverity::Warn => warn!(target: "tor", "{}", log.message),
            LogSeverity::Error => error!(target: "tor", "{}", log.message),
        }
        self.emit(HostEvent::TorLog(log));
    }

    fn on_bootstrap(&mut self, progress: u8) {
        match self.bootstrap.update(progress) {
            Transition::Unchanged | Transition::Exhausted => {}
            Transition::Advanced(_) => {
                self.emit(HostEvent::BootstrapProgress(self.bootstrap.state()));
            }
            Transition::Completed => {
                self.emit(HostEvent::BootstrapProgress(self.bootstrap.state()));
                for identity in self.gate.open() {
                    self.serve(&identity);
                }
                self.subscribe_streams();
            }
        }
    }

    fn on_stream(&mut self, stream: StreamEvent) {
        if !self.bootstrap.is_complete()
            || !stream.status.is_connect_attempt()
            || self.circuits.contains(stream.circuit_id)
        {
            return;
        }
        trace!(
            "Stream {} to {} uses unknown circuit {}",
            stream.stream_id,
            stream.target,
            stream.circuit_id
        );
        if self.circuits.begin_refresh() {
            self.spawn_enumeration();
        }
    }

    fn on_enumerated(&mut self, result: Result<Vec<CircuitRecord>>) {
        match result {
            Ok(records) => {
                for (id, path) in self.circuits.reconcile(records) {
                    self.spawn_resolution(id, path);
                }
            }
            Err(e) => debug!("Circuit enumeration failed: {}", e),
        }
        if self.circuits.end_refresh() {
            self.spawn_enumeration();
        }
    }

    fn on_resolved(&mut self, id: CircuitId, relays: Result<Vec<RelayGeo>>) {
        let relays = match relays {
            Ok(relays) => relays,
            Err(e) => {
                debug!("Resolving circuit {} failed: {}", id, e);
                return;
            }
        };
        let ready = match self.circuits.attach(id, relays) {
            Some(circuit) => circuit.isolation.clone().map(|isolation| CircuitReady {
                isolation,
                relays: circuit.relays.clone(),
            }),
            None => {
                debug!("Circuit {} vanished before it resolved", id);
                return;
            }
        };
        if let Some(ready) = ready {
            info!("Circuit {} ready for {}", id, ready.isolation);
            self.emit(HostEvent::CircuitReady(ready));
        }
    }

    fn serve(&self, identity: &str) {
        match self.circuits.find_by_isolation(identity) {
            Some(circuit) => self.emit(HostEvent::CircuitReady(CircuitReady {
                isolation: identity.to_string(),
                relays: circuit.relays.clone(),
            })),
            None => debug!("No circuit for {} yet", identity),
        }
    }

    fn start(&mut self, reply: oneshot::Sender<Result<()>>) {
        if self.startup_requested {
            let _ = reply.send(Err(ControlError::InvalidState(
                "startup sequence already requested".to_string(),
            )));
            return;
        }
        self.startup_requested = true;

        // Any rejection during startup ends the session.
        let commands = self.commands.fatal();
        let internal = self.internal.clone();
        let credential = self.config.auth.clone();
        let events = event_names(&self.config.events);

        tokio::spawn(async move {
            match startup(&commands, &credential, &events, &internal).await {
                Ok(progress) => {
                    let _ = internal.send(Internal::StartupFinished { progress, reply });
                }
                Err(e) => {
                    let _ = internal.send(Internal::StartupFailed(e.clone()));
                    let _ = reply.send(Err(e));
                }
            }
        });
    }

    fn subscribe_streams(&self) {
        let command = format_command("SETEVENTS", &event_names(&self.config.ready_events()));
        let commands = self.commands.clone();
        tokio::spawn(async move {
            match commands.execute(command).await {
                Ok(_) => debug!("Subscribed to stream notifications"),
                Err(e) => debug!("Stream subscription failed: {}", e),
            }
        });
    }

    fn spawn_enumeration(&self) {
        let commands = self.commands.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = enumerate_circuits(&commands).await;
            let _ = internal.send(Internal::Enumerated(result));
        });
    }

    fn spawn_resolution(&self, id: CircuitId, path: String) {
        let commands = self.commands.clone();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let relays = resolve_path(&commands, &path).await;
            let _ = internal.send(Internal::Resolved { id, relays });
        });
    }
}

async fn startup(
    commands: &CommandSender,
    credential: &auth::AuthCredential,
    events: &[&str],
    internal: &mpsc::UnboundedSender<Internal>,
) -> Result<Option<u8>> {
    let advance = |state| {
        let _ = internal.send(Internal::Advanced(state));
    };

    auth::authenticate(commands, credential).await?;
    advance(SessionState::Authenticated);

    commands.execute(format_command("TAKEOWNERSHIP", &[])).await?;
    advance(SessionState::Owned);

    commands
        .execute(format_command("RESETCONF", &["__OwningControllerProcess"]))
        .await?;

    commands.execute(format_command("SETEVENTS", events)).await?;
    advance(SessionState::Subscribed);

    // A daemon that finished bootstrapping before we subscribed will not
    // announce it again.
    let query = InfoQuery::new("status/bootstrap-phase");
    let command = query.command();
    let phase = commands.submit(command, query).await?;
    let progress = phase.first().and_then(|line| match parse_event("STATUS_CLIENT", line) {
        Event::Status(status) => status.bootstrap_progress(),
        _ => None,
    });
    Ok(progress)
}
