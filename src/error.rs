//! Error taxonomy for the match engine
//!
//! Every failure a command can produce is one of these variants. None of
//! them terminate a session: they are returned to the command issuer while
//! the session state machine stays consistent.

use serde::Serialize;
use thiserror::Error;

/// The kind of entity a lookup failed to find
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, derive_more::Display)]
pub enum Missing {
    /// No session is registered under the access code
    #[display("session")]
    Session,
    /// The question is not part of this session
    #[display("question")]
    Question,
    /// The participant never joined this session
    #[display("participant")]
    Participant,
}

/// Errors returned by session commands
#[derive(Error, Serialize, Debug, Clone, PartialEq)]
pub enum Error {
    /// The answer for this (question, participant) pair is already final
    #[error("answer is already final")]
    AlreadyFinal,
    /// The question no longer accepts submissions
    #[error("question is locked")]
    TooLate,
    /// Unknown session, question or participant
    #[error("{0} not found")]
    NotFound(Missing),
    /// A question is malformed for its evaluation path
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A countdown is already running for the session
    #[error("timer already running")]
    TimerAlreadyRunning,
    /// The command needs a running countdown
    #[error("timer not running")]
    TimerNotRunning,
    /// The command is not valid in the current phase
    #[error("command not valid in the current phase")]
    InvalidPhase,
    /// The sender's role may not issue this command
    #[error("not permitted for this role")]
    NotPermitted,
    /// The payload does not fit the question it targets
    #[error("invalid answer payload")]
    InvalidPayload,
    /// The session has reached the maximum number of participants
    #[error("maximum number of participants reached")]
    MaximumParticipants,
    /// A session already uses this access code
    #[error("access code already in use")]
    AccessCodeTaken,
    /// A different participant already holds the manager role
    #[error("session already has a manager")]
    ManagerAlreadyPresent,
    /// Match or question configuration failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The session task has shut down
    #[error("session closed")]
    SessionClosed,
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::InvalidConfig(report.to_string())
    }
}
