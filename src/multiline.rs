//! GETINFO reply assembly.
//!
//! Tor answers `GETINFO <key>` either with a single value
//! (`250-<key>=<value>`) or with a data block (`250+<key>=` ... `.`),
//! followed in both cases by `250 OK`. An unknown key is answered with
//! `552`, which here simply means "no data".

use crate::error::{Rejection, StatusCode};
use crate::pipeline::{ReplyParser, Step};
use crate::protocol::{format_command, unescape_data_line, ReplyLine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the value line or the block opener.
    Pre,
    /// Inside the data block.
    In,
    /// Waiting for the final status line.
    Post,
}

/// Collects the raw value lines of one GETINFO key.
#[derive(Debug)]
pub struct InfoQuery {
    key: String,
    phase: Phase,
    lines: Vec<String>,
}

impl InfoQuery {
    /// Create a parser for the reply to `GETINFO key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            phase: Phase::Pre,
            lines: Vec::new(),
        }
    }

    /// The command this parser expects to answer.
    pub fn command(&self) -> String {
        format_command("GETINFO", &[&self.key])
    }

    fn is_missing(reply: &ReplyLine) -> bool {
        reply.status_code() == StatusCode::UnrecognizedEntity
    }

    fn pre(&mut self, line: &str) -> Step {
        let Ok(reply) = ReplyLine::parse(line) else {
            return Step::Ignored;
        };
        if Self::is_missing(&reply) {
            return Step::Completed;
        }
        if reply.code == StatusCode::Ok.as_u16() {
            if let Some(value) = self.value_of(&reply.text) {
                if reply.is_data() {
                    self.phase = Phase::In;
                } else {
                    if !value.is_empty() {
                        self.lines.push(value.to_string());
                    }
                    self.phase = Phase::Post;
                }
                return Step::Continue;
            }
        }
        self.reject_or_ignore(reply)
    }

    fn inside(&mut self, line: &str) -> Step {
        if line == "." {
            self.phase = Phase::Post;
        } else {
            self.lines.push(unescape_data_line(line).to_string());
        }
        Step::Continue
    }

    fn post(&mut self, line: &str) -> Step {
        let Ok(reply) = ReplyLine::parse(line) else {
            return Step::Ignored;
        };
        if Self::is_missing(&reply) {
            self.lines.clear();
            return Step::Completed;
        }
        if reply.code == StatusCode::Ok.as_u16() && reply.is_end() {
            return Step::Completed;
        }
        self.reject_or_ignore(reply)
    }

    fn value_of<'a>(&self, text: &'a str) -> Option<&'a str> {
        text.strip_prefix(self.key.as_str())?.strip_prefix('=')
    }

    fn reject_or_ignore(&self, reply: ReplyLine) -> Step {
        if reply.is_end() && reply.status_code().is_error() && reply.code >= 400 {
            Step::Failed(Rejection {
                code: reply.code,
                message: reply.text,
            })
        } else {
            Step::Ignored
        }
    }
}

impl ReplyParser for InfoQuery {
    type Output = Vec<String>;

    fn feed(&mut self, line: &str) -> Step {
        match self.phase {
            Phase::Pre => self.pre(line),
            Phase::In => self.inside(line),
            Phase::Post => self.post(line),
        }
    }

    fn finish(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(query: &mut InfoQuery, lines: &[&str]) -> Vec<Step> {
        lines.iter().map(|l| query.feed(l)).collect()
    }

    #[test]
    fn test_block_reply() {
        let mut query = InfoQuery::new("circuit-status");
        let steps = run(
            &mut query,
            &["250+circuit-status=", "10 BUILT $AAAA~n", ".", "250 OK"],
        );
        assert_eq!(
            steps,
            vec![Step::Continue, Step::Continue, Step::Continue, Step::Completed]
        );
        assert_eq!(query.finish(), vec!["10 BUILT $AAAA~n"]);
    }

    #[test]
    fn test_single_value_reply() {
        let mut query = InfoQuery::new("ip-to-country/1.2.3.4");
        let steps = run(&mut query, &["250-ip-to-country/1.2.3.4=de", "250 OK"]);
        assert_eq!(steps, vec![Step::Continue, Step::Completed]);
        assert_eq!(query.finish(), vec!["de"]);
    }

    #[test]
    fn test_empty_single_value() {
        let mut query = InfoQuery::new("circuit-status");
        run(&mut query, &["250-circuit-status=", "250 OK"]);
        assert!(query.finish().is_empty());
    }

    #[test]
    fn test_missing_key_completes_empty() {
        let mut query = InfoQuery::new("ns/id/AAAA");
        assert_eq!(query.feed("552 Unrecognized key \"ns/id/AAAA\""), Step::Completed);
        assert!(query.finish().is_empty());

        let mut query = InfoQuery::new("ns/id/AAAA");
        run(&mut query, &["250+ns/id/AAAA=", "r relay", "."]);
        assert_eq!(query.feed("552 Unrecognized key"), Step::Completed);
        assert!(query.finish().is_empty());
    }

    #[test]
    fn test_notifications_are_ignored_outside_block() {
        let mut query = InfoQuery::new("circuit-status");
        assert_eq!(query.feed("650 STREAM 1 NEW 0 a:1"), Step::Ignored);
        assert_eq!(query.feed("250+circuit-status="), Step::Continue);
        assert_eq!(query.feed("."), Step::Continue);
        assert_eq!(query.feed("650 STREAM 1 NEW 0 a:1"), Step::Ignored);
        assert_eq!(query.feed("250 OK"), Step::Completed);
    }

    #[test]
    fn test_other_key_is_ignored() {
        let mut query = InfoQuery::new("circuit-status");
        assert_eq!(query.feed("250-version=0.4.8.10"), Step::Ignored);
    }

    #[test]
    fn test_escaped_dot_lines() {
        let mut query = InfoQuery::new("k");
        run(&mut query, &["250+k=", "..dotted", ".", "250 OK"]);
        assert_eq!(query.finish(), vec![".dotted"]);
    }

    #[test]
    fn test_other_errors_fail() {
        let mut query = InfoQuery::new("circuit-status");
        assert_eq!(
            query.feed("551 Internal error"),
            Step::Failed(Rejection {
                code: 551,
                message: "Internal error".to_string()
            })
        );
    }

    #[test]
    fn test_command_text() {
        assert_eq!(InfoQuery::new("ns/id/AAAA").command(), "GETINFO ns/id/AAAA\r\n");
    }
}
