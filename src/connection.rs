//! The connection task.
//!
//! One task owns the byte stream. It frames incoming bytes into lines,
//! routes every line through the command pipeline, and forwards whatever
//! the pipeline does not claim to the notification classifier. Commands
//! arrive over a bounded channel and are written only when they become
//! the active command, so the wire never carries two commands at once.
//!
//! Everything the session must hear about (notifications, rejections of
//! fatal commands, the end of the connection) travels over a single
//! ordered channel, so a rejection is always seen before the close that
//! follows. Other rejections reach only the command's submitter.

use crate::error::{ControlError, Rejection, Result};
use crate::events::{parse_notification, Event};
use crate::pipeline::{CommandPipeline, CommandSender, PendingCommand, Routed};
use crate::protocol::LineFramer;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 4096;

/// What the connection reports to the session.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// An asynchronous notification.
    Event(Event),
    /// The daemon rejected a fatal command.
    CommandFailed(Rejection),
    /// The connection is gone. `None` means a clean close.
    Closed(Option<ControlError>),
}

/// The session's side of a running connection task.
pub(crate) struct ConnectionHandle {
    pub commands: CommandSender,
    pub inbound: mpsc::Receiver<Inbound>,
    pub shutdown: oneshot::Sender<()>,
}

/// Spawn the connection task for `stream`.
pub(crate) fn spawn<S>(stream: S, capacity: usize) -> ConnectionHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let connection = Connection {
        stream,
        framer: LineFramer::new(),
        pipeline: CommandPipeline::new(),
        commands: command_rx,
        inbound: inbound_tx,
        shutdown: shutdown_rx,
    };
    tokio::spawn(connection.run());

    ConnectionHandle {
        commands: CommandSender::new(command_tx),
        inbound: inbound_rx,
        shutdown: shutdown_tx,
    }
}

struct Connection<S> {
    stream: S,
    framer: LineFramer,
    pipeline: CommandPipeline,
    commands: mpsc::Receiver<PendingCommand>,
    inbound: mpsc::Sender<Inbound>,
    shutdown: oneshot::Receiver<()>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let reason = match self.drive().await {
            Ok(()) => None,
            Err(e) => Some(e),
        };
        match &reason {
            Some(e) => warn!("Control connection failed: {}", e),
            None => debug!("Control connection closed"),
        }

        self.pipeline.abandon();
        self.commands.close();
        // Nobody may be listening anymore.
        let _ = self.inbound.send(Inbound::Closed(reason)).await;
        let _ = self.stream.shutdown().await;
    }

    async fn drive(&mut self) -> Result<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = &mut self.shutdown => {
                    debug!("Connection shutdown requested");
                    return Ok(());
                }
                read = self.stream.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Ok(());
                    }
                    for line in self.framer.push(&buf[..n]) {
                        self.handle_line(&line).await?;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return Ok(());
                    };
                    if let Some(text) = self.pipeline.submit(command) {
                        self.write(&text).await?;
                    }
                }
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<()> {
        trace!("<< {}", line);

        match self.pipeline.route(line) {
            Routed::Consumed => {}
            Routed::Completed { next } => {
                if let Some(text) = next {
                    self.write(&text).await?;
                }
            }
            Routed::Failed {
                rejection,
                fatal,
                next,
            } => {
                if fatal {
                    self.report(Inbound::CommandFailed(rejection)).await?;
                }
                if let Some(text) = next {
                    self.write(&text).await?;
                }
            }
            Routed::Unsolicited => match parse_notification(line) {
                Ok(Some(event)) => self.report(Inbound::Event(event)).await?,
                Ok(None) => debug!("Discarding unsolicited reply: {}", line),
                Err(e) => warn!("Discarding unparsable line {:?}: {}", line, e),
            },
        }
        Ok(())
    }

    async fn report(&mut self, message: Inbound) -> Result<()> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| ControlError::ConnectionClosed)
    }

    async fn write(&mut self, text: &str) -> Result<()> {
        trace!(">> {}", text.trim_end());
        self.stream.write_all(text.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
