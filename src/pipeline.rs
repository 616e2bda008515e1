//! Command pipeline.
//!
//! Replies on the control port carry no request identifier; the only way
//! to pair a reply with its command is order. The pipeline therefore
//! keeps exactly one command in flight and parks the rest in FIFO order.
//! Every incoming line is offered to the active command's [`ReplyParser`],
//! which decides whether the line finishes the reply, is part of it, or
//! belongs to someone else (an asynchronous notification).

use crate::error::{ControlError, Rejection};
use crate::protocol::ReplyLine;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// What a parser made of one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The reply is complete; the caller gets the parser's output.
    Completed,
    /// The line was part of the reply; keep feeding.
    Continue,
    /// Not ours; hand it to the notification dispatcher.
    Ignored,
    /// Tor rejected the command.
    Failed(Rejection),
}

/// Incremental parser for the reply to one command.
pub trait ReplyParser: Send + 'static {
    /// Value handed back to the submitter on completion.
    type Output: Send + 'static;

    /// Consume one line of the reply.
    fn feed(&mut self, line: &str) -> Step;

    /// Produce the result once [`Step::Completed`] was returned.
    fn finish(self) -> Self::Output;
}

/// Receives the outcome of a command once its reply is over.
pub trait ReplySink: Send {
    /// Offer a line to the command's parser.
    fn feed(&mut self, line: &str) -> Step;
    /// The reply completed successfully.
    fn complete(self: Box<Self>);
    /// The command failed or will never be answered.
    fn fail(self: Box<Self>, error: ControlError);
}

/// A command waiting for, or holding, the wire.
pub struct PendingCommand {
    text: String,
    sink: Box<dyn ReplySink>,
    fatal: bool,
}

impl PendingCommand {
    /// Pair the outgoing text with the sink that will parse its reply.
    pub fn new(text: impl Into<String>, sink: Box<dyn ReplySink>) -> Self {
        Self {
            text: text.into(),
            sink,
            fatal: false,
        }
    }

    /// Mark the command as one the session cannot survive a rejection of.
    ///
    /// Only the submitter hears about a rejected ordinary command.
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

impl std::fmt::Debug for PendingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommand")
            .field("text", &self.text.trim_end())
            .field("fatal", &self.fatal)
            .finish_non_exhaustive()
    }
}

/// Where a line went.
#[derive(Debug, PartialEq, Eq)]
pub enum Routed {
    /// Consumed by the active command, which is still waiting for more.
    Consumed,
    /// The active command completed; `next` must be written if present.
    Completed {
        /// Text of the command that just became active.
        next: Option<String>,
    },
    /// The active command was rejected; `next` must be written if present.
    Failed {
        /// What Tor said.
        rejection: Rejection,
        /// Whether the rejected command was marked [`PendingCommand::fatal`].
        fatal: bool,
        /// Text of the command that just became active.
        next: Option<String>,
    },
    /// No command wanted the line.
    Unsolicited,
}

/// One active slot plus a FIFO of parked commands.
#[derive(Default)]
pub struct CommandPipeline {
    active: Option<Active>,
    waiting: VecDeque<PendingCommand>,
}

struct Active {
    sink: Box<dyn ReplySink>,
    fatal: bool,
}

impl CommandPipeline {
    /// Create an idle pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command. Returns its text if it became active right away
    /// and must be written now.
    pub fn submit(&mut self, command: PendingCommand) -> Option<String> {
        if self.active.is_some() {
            trace!(
                "Parking command behind {} others: {}",
                self.waiting.len(),
                command.text.trim_end()
            );
            self.waiting.push_back(command);
            return None;
        }
        self.activate(command)
    }

    /// Offer an incoming line to the active command.
    pub fn route(&mut self, line: &str) -> Routed {
        let Some(active) = self.active.as_mut() else {
            return Routed::Unsolicited;
        };

        match active.sink.feed(line) {
            Step::Continue => Routed::Consumed,
            Step::Ignored => Routed::Unsolicited,
            Step::Completed => {
                if let Some(done) = self.active.take() {
                    done.sink.complete();
                }
                Routed::Completed {
                    next: self.advance(),
                }
            }
            Step::Failed(rejection) => {
                debug!("Command rejected: {} {}", rejection.code, rejection.message);
                let mut fatal = false;
                if let Some(done) = self.active.take() {
                    fatal = done.fatal;
                    done.sink.fail(rejection.clone().into());
                }
                Routed::Failed {
                    rejection,
                    fatal,
                    next: self.advance(),
                }
            }
        }
    }

    /// Whether no command is in flight.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Number of parked commands.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    /// Reject the active and every parked command.
    pub fn abandon(&mut self) {
        if let Some(active) = self.active.take() {
            active.sink.fail(ControlError::ConnectionClosed);
        }
        for parked in self.waiting.drain(..) {
            parked.sink.fail(ControlError::ConnectionClosed);
        }
    }

    fn advance(&mut self) -> Option<String> {
        let next = self.waiting.pop_front()?;
        self.activate(next)
    }

    fn activate(&mut self, command: PendingCommand) -> Option<String> {
        self.active = Some(Active {
            sink: command.sink,
            fatal: command.fatal,
        });
        Some(command.text)
    }
}

impl Drop for CommandPipeline {
    fn drop(&mut self) {
        self.abandon();
    }
}

/// Parser for commands whose reply is a plain status.
///
/// Collects the text of every reply line; completes on a successful final
/// line and fails on an error final line.
#[derive(Debug, Default)]
pub struct StatusReply {
    lines: Vec<String>,
}

impl StatusReply {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplyParser for StatusReply {
    type Output = Vec<String>;

    fn feed(&mut self, line: &str) -> Step {
        let Ok(reply) = ReplyLine::parse(line) else {
            return Step::Ignored;
        };
        if reply.is_async_event() {
            return Step::Ignored;
        }
        if reply.status_code().is_success() {
            let end = reply.is_end();
            self.lines.push(reply.text);
            return if end {
                Step::Completed
            } else {
                Step::Continue
            };
        }
        if reply.is_end() && reply.code >= 400 {
            return Step::Failed(Rejection {
                code: reply.code,
                message: reply.text,
            });
        }
        Step::Ignored
    }

    fn finish(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(feature = "tokio-runtime")]
pub use channel::{CommandSender, Submission};

#[cfg(feature = "tokio-runtime")]
mod channel {
    use super::*;
    use crate::error::Result;
    use tokio::sync::{mpsc, oneshot};

    /// A parser paired with the channel its submitter waits on.
    pub struct Submission<P: ReplyParser> {
        parser: P,
        reply: oneshot::Sender<Result<P::Output>>,
    }

    impl<P: ReplyParser> Submission<P> {
        /// Create a submission and the receiver for its outcome.
        pub fn new(parser: P) -> (Self, oneshot::Receiver<Result<P::Output>>) {
            let (reply, rx) = oneshot::channel();
            (Self { parser, reply }, rx)
        }
    }

    impl<P: ReplyParser> ReplySink for Submission<P> {
        fn feed(&mut self, line: &str) -> Step {
            self.parser.feed(line)
        }

        fn complete(self: Box<Self>) {
            let this = *self;
            // The submitter may have stopped waiting.
            let _ = this.reply.send(Ok(this.parser.finish()));
        }

        fn fail(self: Box<Self>, error: ControlError) {
            let _ = self.reply.send(Err(error));
        }
    }

    /// Cloneable entry point into the connection's pipeline.
    #[derive(Clone, Debug)]
    pub struct CommandSender {
        tx: mpsc::Sender<PendingCommand>,
        fatal: bool,
    }

    impl CommandSender {
        pub(crate) fn new(tx: mpsc::Sender<PendingCommand>) -> Self {
            Self { tx, fatal: false }
        }

        /// A sender whose commands end the session when rejected.
        pub(crate) fn fatal(&self) -> Self {
            Self {
                tx: self.tx.clone(),
                fatal: true,
            }
        }

        /// Send `command` and wait for `parser` to finish its reply.
        ///
        /// Replies are paired with commands strictly in submission order.
        /// Fails with [`ControlError::ConnectionClosed`] if the connection
        /// goes away before the reply completes.
        pub async fn submit<P: ReplyParser>(
            &self,
            command: impl Into<String>,
            parser: P,
        ) -> Result<P::Output> {
            let (submission, rx) = Submission::new(parser);
            let mut pending = PendingCommand::new(command, Box::new(submission));
            if self.fatal {
                pending = pending.fatal();
            }
            self.tx
                .send(pending)
                .await
                .map_err(|_| ControlError::ConnectionClosed)?;
            rx.await.map_err(|_| ControlError::ConnectionClosed)?
        }

        /// Send a command whose reply is a plain status.
        pub async fn execute(&self, command: impl Into<String>) -> Result<Vec<String>> {
            self.submit(command, StatusReply::new()).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    /// Completes on `250 OK`, records how it ended.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl ReplySink for Recorder {
        fn feed(&mut self, line: &str) -> Step {
            StatusReply::new().feed(line)
        }

        fn complete(self: Box<Self>) {
            self.log.lock().unwrap().push(format!("{} ok", self.name));
        }

        fn fail(self: Box<Self>, error: ControlError) {
            self.log.lock().unwrap().push(format!("{} failed: {}", self.name, error));
        }
    }

    fn command(name: &'static str, log: &Log) -> PendingCommand {
        PendingCommand::new(
            format!("{}\r\n", name),
            Box::new(Recorder {
                name,
                log: log.clone(),
            }),
        )
    }

    #[test]
    fn test_first_command_activates_immediately() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        assert!(pipeline.is_idle());

        assert_eq!(pipeline.submit(command("A", &log)), Some("A\r\n".to_string()));
        assert_eq!(pipeline.submit(command("B", &log)), None);
        assert!(!pipeline.is_idle());
        assert_eq!(pipeline.waiting(), 1);
    }

    #[test]
    fn test_replies_pair_in_fifo_order() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        pipeline.submit(command("A", &log));
        pipeline.submit(command("B", &log));

        assert_eq!(
            pipeline.route("250 OK"),
            Routed::Completed {
                next: Some("B\r\n".to_string())
            }
        );
        assert_eq!(*log.lock().unwrap(), vec!["A ok"]);

        assert_eq!(pipeline.route("250 OK"), Routed::Completed { next: None });
        assert_eq!(*log.lock().unwrap(), vec!["A ok", "B ok"]);
        assert!(pipeline.is_idle());
    }

    #[test]
    fn test_notification_while_active_is_unsolicited() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        pipeline.submit(command("A", &log));

        assert_eq!(
            pipeline.route("650 STATUS_CLIENT NOTICE BOOTSTRAP PROGRESS=5"),
            Routed::Unsolicited
        );
        assert!(log.lock().unwrap().is_empty());
        assert!(!pipeline.is_idle());
    }

    #[test]
    fn test_idle_pipeline_routes_everything_out() {
        let mut pipeline = CommandPipeline::new();
        assert_eq!(pipeline.route("250 OK"), Routed::Unsolicited);
    }

    #[test]
    fn test_rejection_fails_only_the_active_command() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        pipeline.submit(command("A", &log));
        pipeline.submit(command("B", &log));

        let routed = pipeline.route("515 Authentication failed");
        match routed {
            Routed::Failed {
                rejection,
                fatal,
                next,
            } => {
                assert_eq!(rejection.code, 515);
                assert!(!fatal);
                assert_eq!(next, Some("B\r\n".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("A failed"));
    }

    #[test]
    fn test_rejection_keeps_fatal_mark() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        pipeline.submit(command("AUTHENTICATE", &log).fatal());
        pipeline.submit(command("GETINFO", &log));

        assert!(matches!(
            pipeline.route("515 Authentication failed"),
            Routed::Failed { fatal: true, .. }
        ));
        assert!(matches!(
            pipeline.route("551 Internal error"),
            Routed::Failed { fatal: false, next: None, .. }
        ));
    }

    #[test]
    fn test_abandon_rejects_everything() {
        let log = Log::default();
        let mut pipeline = CommandPipeline::new();
        pipeline.submit(command("A", &log));
        pipeline.submit(command("B", &log));
        pipeline.abandon();

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.ends_with("Connection closed")));
        assert!(pipeline.is_idle());
        assert_eq!(pipeline.waiting(), 0);
    }

    #[test]
    fn test_status_reply() {
        let mut parser = StatusReply::new();
        assert_eq!(parser.feed("250-PROTOCOLINFO 1"), Step::Continue);
        assert_eq!(parser.feed("650 NOTICE hi"), Step::Ignored);
        assert_eq!(parser.feed("not a reply"), Step::Ignored);
        assert_eq!(parser.feed("250 OK"), Step::Completed);
        assert_eq!(parser.finish(), vec!["PROTOCOLINFO 1", "OK"]);

        let mut parser = StatusReply::new();
        assert_eq!(parser.feed("250 OK"), Step::Completed);
        assert_eq!(parser.finish(), vec!["OK"]);

        let mut parser = StatusReply::new();
        assert_eq!(
            parser.feed("552 Unrecognized option"),
            Step::Failed(Rejection {
                code: 552,
                message: "Unrecognized option".to_string()
            })
        );
    }

    #[cfg(feature = "tokio-runtime")]
    #[tokio::test]
    async fn test_submission_reports_outcome() {
        let (submission, rx) = Submission::new(StatusReply::new());
        let mut sink: Box<dyn ReplySink> = Box::new(submission);
        assert_eq!(sink.feed("250 OK"), Step::Completed);
        sink.complete();
        assert_eq!(rx.await.unwrap().unwrap(), vec!["OK"]);

        let (submission, rx) = Submission::new(StatusReply::new());
        Box::new(submission).fail(ControlError::ConnectionClosed);
        assert!(matches!(rx.await.unwrap(), Err(ControlError::ConnectionClosed)));
    }
}
