//! Answer collection
//!
//! The [`Ledger`] holds one record per (question, participant) pair for the
//! question being played. A record may be overwritten any number of times
//! while provisional; once final it is frozen until the ledger moves on to
//! the next question, at which point the whole map is archived untouched.

use std::collections::{BTreeSet, HashMap, hash_map::Entry};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::debug;
use web_time::SystemTime;

use crate::{Error, evaluator::Verdict, presence::Id, question::QuestionId};

/// What a participant submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnswerPayload {
    /// Selected option indices of a choice question
    Choice(BTreeSet<usize>),
    /// Free text
    Text(String),
    /// A numeric value
    Numeric(f64),
}

/// Who froze an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Finalization {
    /// The participant submitted it as final
    Participant,
    /// The question locked while the answer was still provisional
    Deadline,
}

/// One participant's answer to one question
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// The latest payload
    pub payload: AnswerPayload,
    /// Last time the payload changed
    pub updated_at: SystemTime,
    /// Set once the answer is frozen
    pub finalized: Option<Finalization>,
    /// Outcome, filled in when the question locks
    pub verdict: Option<Verdict>,
    /// Points earned, filled in when the question locks
    pub points: u64,
}

impl Answer {
    fn new(payload: AnswerPayload) -> Self {
        Self {
            payload,
            updated_at: SystemTime::now(),
            finalized: None,
            verdict: None,
            points: 0,
        }
    }

    /// Whether the answer can no longer change
    pub fn is_final(&self) -> bool {
        self.finalized.is_some()
    }
}

/// Result of [`Ledger::lookup`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    /// The participant has not answered
    NotFound,
    /// The participant answered but may still change it
    Provisional(&'a Answer),
    /// The answer is frozen
    Final(&'a Answer),
}

/// Answers for the current question plus the archive of earlier ones
#[derive(Debug, Default)]
pub struct Ledger {
    question: Option<QuestionId>,
    current: HashMap<Id, Answer>,
    locked: bool,
    archive: Vec<(QuestionId, HashMap<Id, Answer>)>,
}

impl Ledger {
    /// The question currently collecting answers
    pub fn question(&self) -> Option<&QuestionId> {
        self.question.as_ref()
    }

    /// Whether the current question stopped accepting answers
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    fn check_writable(&self, participant: Id) -> Result<(), Error> {
        if self.locked || self.question.is_none() {
            return Err(Error::TooLate);
        }
        match self.current.get(&participant) {
            Some(answer) if answer.is_final() => Err(Error::AlreadyFinal),
            _ => Ok(()),
        }
    }

    fn write(&mut self, participant: Id, payload: AnswerPayload, finalized: Option<Finalization>) {
        match self.current.entry(participant) {
            Entry::Occupied(mut entry) => {
                let answer = entry.get_mut();
                answer.payload = payload;
                answer.updated_at = SystemTime::now();
                answer.finalized = finalized;
            }
            Entry::Vacant(entry) => {
                entry.insert(Answer {
                    finalized,
                    ..Answer::new(payload)
                });
            }
        }
    }

    /// Inserts or replaces a provisional answer
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyFinal`] if the participant already finalized
    /// * [`Error::TooLate`] if the ledger is locked
    pub fn upsert_provisional(&mut self, participant: Id, payload: AnswerPayload) -> Result<(), Error> {
        self.check_writable(participant)?;
        self.write(participant, payload, None);
        Ok(())
    }

    /// Records a final answer, creating it directly if none exists
    ///
    /// # Errors
    ///
    /// * [`Error::AlreadyFinal`] on a second finalization
    /// * [`Error::TooLate`] if the ledger is locked
    pub fn finalize(&mut self, participant: Id, payload: AnswerPayload) -> Result<(), Error> {
        self.check_writable(participant)?;
        self.write(participant, payload, Some(Finalization::Participant));
        Ok(())
    }

    /// Freezes every provisional answer and rejects further writes
    pub fn lock(&mut self) {
        let mut frozen = 0_usize;
        for answer in self.current.values_mut().filter(|a| !a.is_final()) {
            answer.finalized = Some(Finalization::Deadline);
            frozen += 1;
        }
        self.locked = true;
        debug!(frozen, "ledger locked");
    }

    /// Archives the current answers and starts collecting for `next`
    ///
    /// Passing `None` archives without opening a new question.
    pub fn advance_question(&mut self, next: Option<QuestionId>) {
        if let Some(question) = self.question.take() {
            self.archive
                .push((question, std::mem::take(&mut self.current)));
        }
        self.current.clear();
        self.question = next;
        self.locked = false;
    }

    /// Looks up a participant's answer to the current question
    pub fn lookup(&self, participant: Id) -> Lookup<'_> {
        match self.current.get(&participant) {
            None => Lookup::NotFound,
            Some(answer) if answer.is_final() => Lookup::Final(answer),
            Some(answer) => Lookup::Provisional(answer),
        }
    }

    /// Answers to an archived question
    pub fn archived(&self, question: &QuestionId) -> Option<&HashMap<Id, Answer>> {
        self.archive
            .iter()
            .find(|(id, _)| id == question)
            .map(|(_, answers)| answers)
    }

    /// Iterates the answers to the current question
    pub fn answers(&self) -> impl Iterator<Item = (Id, &Answer)> {
        self.current.iter().map(|(id, answer)| (*id, answer))
    }

    /// Stores the outcome of evaluating a locked answer
    pub(crate) fn record_outcome(&mut self, participant: Id, verdict: Verdict, points: u64) {
        if let Some(answer) = self.current.get_mut(&participant) {
            answer.verdict = Some(verdict);
            answer.points = points;
        }
    }

    /// Number of answers to the current question
    pub fn len(&self) -> usize {
        self.current.len()
    }

    /// Whether nobody answered the current question yet
    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Number of frozen answers to the current question
    pub fn finalized_count(&self) -> usize {
        self.current.values().filter(|a| a.is_final()).count()
    }

    /// Whether every listed participant has a final answer
    pub fn all_final<I: IntoIterator<Item = Id>>(&self, participants: I) -> bool {
        participants
            .into_iter()
            .all(|id| matches!(self.lookup(id), Lookup::Final(_)))
    }
}
