//! Per-session state machine
//!
//! A [`Session`] is the authoritative state of one live match. It is plain
//! synchronous code: the actor that owns it feeds it joins, commands and
//! timer wake-ups one at a time, and the session pushes the resulting frames
//! through each participant's tunnel.
//!
//! Phases move `Lobby → QuestionActive → QuestionLocked → ShowingResults`,
//! then either back to `QuestionActive` for the next question or on to
//! `MatchComplete`.

use std::collections::HashSet;

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::{debug, info, warn};

use crate::{
    Error,
    access_code::AccessCode,
    answer::{AnswerPayload, Finalization, Ledger, Lookup},
    config::MatchConfig,
    error::Missing,
    evaluator::{self, Grade, Verdict},
    histogram::{HistogramSnapshot, TypingTracker},
    presence::{Id, Joined, Presence, PresenceEntry, Role},
    question::{self, KindTag, Question, QuestionId, QuestionKind, QuestionView},
    scoreboard::{FinalSummary, ScoreMessage, Scoreboard, Standing},
    timer::{Schedule, TickOutcome, Timer, TimerMode},
    tunnel::Tunnel,
};

/// Where the match currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// Waiting for the manager to start
    Lobby,
    /// Collecting answers for the question at this index
    QuestionActive(usize),
    /// No longer accepting answers for the question at this index
    ///
    /// Transient: scoring runs in the same step that locks, so the session
    /// is already in `ShowingResults` once the locking command returns.
    QuestionLocked(usize),
    /// Results of the question at this index are on screen
    ShowingResults(usize),
    /// Every question was played, or the manager ended the match
    MatchComplete,
}

/// Messages received from participants, split by sender role
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingMessage {
    /// Commands from the manager
    Manager(IncomingManagerMessage),
    /// Messages from players
    Player(IncomingPlayerMessage),
}

impl IncomingMessage {
    /// Whether a participant with this role may send the message
    fn follows(&self, role: Role) -> bool {
        matches!(
            (self, role),
            (IncomingMessage::Manager(_), Role::Manager)
                | (IncomingMessage::Player(_), Role::Player)
        )
    }
}

/// Commands the manager can issue
#[derive(Debug, Deserialize, Clone, Copy)]
pub enum IncomingManagerMessage {
    /// Leave the lobby and play the first question
    StartMatch,
    /// Move from results to the next question, or finish the match
    Advance,
    /// Start a countdown of the given length
    StartTimer(u32),
    /// Stop the countdown
    StopTimer,
    /// Accelerate the countdown
    EnterPanicMode,
    /// Restart a stopped countdown from where it stopped
    ResumeTimer,
    /// Grade a free-text answer
    Grade {
        /// Whose answer
        participant: Id,
        /// The grade
        grade: Grade,
    },
    /// End the match now
    EndMatch,
}

/// Messages players can send
#[derive(Debug, Deserialize, Clone)]
pub enum IncomingPlayerMessage {
    /// Submit or update an answer
    SubmitAnswer {
        /// The question being answered
        question: QuestionId,
        /// The answer itself
        payload: AnswerPayload,
        /// Whether this is the player's final answer
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// Whether the player is currently typing a free-text answer
    SetTypingState(bool),
}

/// A player's own answer as shown with the results
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnswerResult {
    /// What was submitted
    pub payload: AnswerPayload,
    /// Evaluation outcome
    pub verdict: Option<Verdict>,
    /// Points earned
    pub points: u64,
}

/// Incremental updates pushed to participants
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum UpdateMessage {
    /// The countdown moved
    Tick {
        /// Remaining time in ticks
        remaining: u32,
        /// Cadence the tick was produced with
        mode: TimerMode,
    },
    /// A new question is open for answers
    QuestionStarted {
        /// Question index
        index: usize,
        /// Number of questions
        count: usize,
        /// The question, without correctness information
        question: QuestionView,
    },
    /// Live histogram (manager only)
    HistogramUpdate(HistogramSnapshot),
    /// The question stopped accepting answers
    QuestionLocked {
        /// The locked question
        question: QuestionId,
    },
    /// Results of the locked question
    ResultsShown {
        /// The question
        question: QuestionId,
        /// The recipient's own answer (players only)
        answer: Option<AnswerResult>,
        /// The recipient's score (players only)
        score: Option<ScoreMessage>,
        /// Standings after this question
        standings: Vec<Standing>,
        /// Final histogram of the question
        histogram: HistogramSnapshot,
    },
    /// The match is over
    MatchComplete(FinalSummary),
    /// Participant list (manager only)
    Presence(Vec<PresenceEntry>),
    /// A free-text answer was graded
    Graded {
        /// Whose answer
        participant: Id,
        /// The grade given
        grade: Grade,
        /// Points awarded
        points: u64,
    },
}

/// Full state sent to a participant on (re)join
#[skip_serializing_none]
#[derive(Debug, Serialize, Clone)]
pub enum SyncMessage {
    /// Waiting for the manager
    Lobby {
        /// Number of participants so far
        participants: usize,
    },
    /// A question is open
    Question {
        /// Question index
        index: usize,
        /// Number of questions
        count: usize,
        /// The question, without correctness information
        question: QuestionView,
        /// Remaining time in ticks
        remaining: u32,
        /// Cadence, if a countdown or refresh is scheduled
        mode: Option<TimerMode>,
        /// The recipient's current answer
        answer: Option<AnswerPayload>,
        /// Whether that answer is final
        is_final: bool,
        /// The recipient's score (players only)
        score: Option<ScoreMessage>,
    },
    /// Results are on screen
    Results {
        /// Question index
        index: usize,
        /// Number of questions
        count: usize,
        /// The question
        question: QuestionId,
        /// The recipient's own answer (players only)
        answer: Option<AnswerResult>,
        /// The recipient's score (players only)
        score: Option<ScoreMessage>,
        /// Current standings
        standings: Vec<Standing>,
        /// Final histogram of the question
        histogram: Option<HistogramSnapshot>,
    },
    /// The match is over
    Complete(FinalSummary),
}

/// Read-only projection published after every handled command
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    /// Session access code
    pub code: AccessCode,
    /// Current phase
    pub phase: Phase,
    /// Remaining time in ticks
    pub remaining: u32,
    /// Timer cadence, if anything is scheduled
    pub mode: Option<TimerMode>,
    /// Latest histogram of the current or last question
    pub histogram: Option<HistogramSnapshot>,
    /// Participant list
    pub participants: Vec<PresenceEntry>,
    /// Current standings
    pub standings: Vec<Standing>,
}

/// The state of one live match
pub struct Session<T> {
    code: AccessCode,
    questions: Vec<Question>,
    config: MatchConfig,
    phase: Phase,
    presence: Presence<T>,
    timer: Timer,
    ledger: Ledger,
    typing: TypingTracker,
    scoreboard: Scoreboard,
    graded: HashSet<Id>,
    histogram: Option<HistogramSnapshot>,
    ended: bool,
}

impl<T> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("code", &self.code)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl<T: Tunnel> Session<T> {
    /// Creates a session in the lobby
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the timing configuration or any
    /// question fails validation.
    pub fn new(code: AccessCode, questions: Vec<Question>, config: MatchConfig) -> Result<Self, Error> {
        config.validate()?;
        question::validate_all(&questions)?;

        info!(session = %code, questions = questions.len(), "session created");

        Ok(Self {
            code,
            questions,
            config,
            phase: Phase::Lobby,
            presence: Presence::new(code),
            timer: Timer::default(),
            ledger: Ledger::default(),
            typing: TypingTracker::new(config.typing_idle_ticks),
            scoreboard: Scoreboard::default(),
            graded: HashSet::new(),
            histogram: None,
            ended: false,
        })
    }

    /// The session's access code
    pub fn code(&self) -> AccessCode {
        self.code
    }

    /// The current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Participants of the session
    pub fn presence(&self) -> &Presence<T> {
        &self.presence
    }

    /// Answers to the current question and the archive
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Running scores
    pub fn scoreboard(&self) -> &Scoreboard {
        &self.scoreboard
    }

    /// The session countdown
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Whether the manager ended the match and the session should go away
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(session = %self.code, from = ?self.phase, to = ?phase, "phase changed");
        self.phase = phase;
    }

    fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Attaches a participant, or reattaches a returning one
    ///
    /// The participant receives a full state sync; the manager receives the
    /// updated participant list.
    ///
    /// # Errors
    ///
    /// See [`Presence::join`].
    pub fn join(&mut self, id: Id, name: String, role: Role, tunnel: T) -> Result<(), Error> {
        let joined = self.presence.join(id, name, role, tunnel)?;
        let role = self.presence.role(id).unwrap_or(role);

        info!(
            session = %self.code,
            participant = %id,
            ?role,
            returning = joined == Joined::Returning,
            "participant joined"
        );

        self.presence.send_state(&self.state_message(id, role), id);
        if role == Role::Manager {
            if let (Phase::QuestionActive(_), Some(histogram)) = (self.phase, &self.histogram) {
                self.presence
                    .send_message(&UpdateMessage::HistogramUpdate(histogram.clone()), id);
            }
        }
        self.announce_presence();

        Ok(())
    }

    /// Marks a participant as disconnected
    ///
    /// The participant stays in the ledger and the participant list. If they
    /// were the last player without a final answer, the question locks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the participant never joined.
    pub fn disconnect(&mut self, id: Id) -> Result<(), Error> {
        self.presence.disconnect(id)?;
        self.typing.set(id, false);

        info!(session = %self.code, participant = %id, "participant disconnected");

        self.announce_presence();
        self.lock_if_all_final();

        Ok(())
    }

    /// Processes a message from a participant
    ///
    /// `schedule` receives every timer schedule the command creates.
    ///
    /// # Errors
    ///
    /// * [`Error::NotFound`] if the sender never joined
    /// * [`Error::NotPermitted`] if the sender's role may not send this message
    /// * any error of the command itself
    pub fn receive_message<S: FnMut(Schedule)>(
        &mut self,
        sender: Id,
        message: IncomingMessage,
        schedule: S,
    ) -> Result<(), Error> {
        let role = self
            .presence
            .role(sender)
            .ok_or(Error::NotFound(Missing::Participant))?;

        if !message.follows(role) {
            return match message {
                IncomingMessage::Manager(IncomingManagerMessage::StartTimer(_)) => Ok(()),
                _ => Err(Error::NotPermitted),
            };
        }

        match message {
            IncomingMessage::Manager(message) => self.receive_manager_message(message, schedule),
            IncomingMessage::Player(message) => self.receive_player_message(sender, message),
        }
    }

    fn receive_manager_message<S: FnMut(Schedule)>(
        &mut self,
        message: IncomingManagerMessage,
        mut schedule: S,
    ) -> Result<(), Error> {
        match (message, self.phase) {
            (IncomingManagerMessage::EndMatch, _) => {
                self.end_match();
                Ok(())
            }
            (IncomingManagerMessage::StartMatch, Phase::Lobby) => {
                self.enter_question(0, &mut schedule);
                Ok(())
            }
            (IncomingManagerMessage::Advance, Phase::ShowingResults(index)) => {
                self.enter_question(index + 1, &mut schedule);
                Ok(())
            }
            (IncomingManagerMessage::StartTimer(duration), Phase::QuestionActive(_)) => {
                schedule(self.timer.start(duration, self.config.tick_interval)?);
                info!(session = %self.code, duration, "timer started by manager");
                Ok(())
            }
            (IncomingManagerMessage::StopTimer, Phase::QuestionActive(index)) => {
                if self.questions[index].kind.tag() == KindTag::FreeText && self.timer.is_running() {
                    schedule(self.timer.pause_with_refresh(self.config.histogram_interval)?);
                } else {
                    self.timer.stop();
                }
                info!(session = %self.code, remaining = self.timer.remaining(), "timer stopped by manager");
                Ok(())
            }
            (IncomingManagerMessage::EnterPanicMode, Phase::QuestionActive(_)) => {
                if let Some(panic) = self.timer.enter_panic_mode(self.config.panic_interval)? {
                    info!(session = %self.code, remaining = self.timer.remaining(), "panic mode");
                    schedule(panic);
                }
                Ok(())
            }
            (IncomingManagerMessage::ResumeTimer, Phase::QuestionActive(_)) => {
                schedule(
                    self.timer
                        .resume(self.timer.remaining(), self.config.tick_interval)?,
                );
                Ok(())
            }
            (IncomingManagerMessage::Grade { participant, grade }, Phase::ShowingResults(index)) => {
                self.grade(index, participant, grade)
            }
            _ => Err(Error::InvalidPhase),
        }
    }

    fn receive_player_message(&mut self, sender: Id, message: IncomingPlayerMessage) -> Result<(), Error> {
        match message {
            IncomingPlayerMessage::SubmitAnswer {
                question,
                payload,
                is_final,
            } => self.submit(sender, &question, payload, is_final),
            IncomingPlayerMessage::SetTypingState(typing) => {
                if let Phase::QuestionActive(index) = self.phase {
                    if self.questions[index].kind.tag() == KindTag::FreeText {
                        self.typing.set(sender, typing);
                        self.announce_histogram();
                    }
                }
                Ok(())
            }
        }
    }

    fn submit(
        &mut self,
        sender: Id,
        question: &QuestionId,
        payload: AnswerPayload,
        is_final: bool,
    ) -> Result<(), Error> {
        let target = self
            .questions
            .iter()
            .position(|q| &q.id == question)
            .ok_or(Error::NotFound(Missing::Question))?;

        match self.phase {
            Phase::QuestionActive(index) if index == target => {}
            Phase::QuestionActive(index)
            | Phase::QuestionLocked(index)
            | Phase::ShowingResults(index)
                if target <= index =>
            {
                return Err(Error::TooLate);
            }
            Phase::MatchComplete => return Err(Error::TooLate),
            _ => return Err(Error::InvalidPhase),
        }

        evaluator::check_payload(&self.questions[target], &payload)?;

        if is_final {
            self.ledger.finalize(sender, payload)?;
            self.typing.set(sender, false);
        } else {
            self.ledger.upsert_provisional(sender, payload)?;
        }

        debug!(session = %self.code, participant = %sender, is_final, "answer recorded");

        self.announce_histogram();
        if is_final {
            self.lock_if_all_final();
        }

        Ok(())
    }

    /// Processes a timer wake-up
    ///
    /// Wake-ups from stopped or superseded schedules are ignored.
    pub fn receive_wake(&mut self, epoch: u64) {
        let Phase::QuestionActive(index) = self.phase else {
            return;
        };
        let mode = self.timer.mode().unwrap_or(TimerMode::Normal);
        let Some(outcome) = self.timer.tick(epoch) else {
            return;
        };

        self.typing.age();

        match outcome {
            TickOutcome::Tick { remaining } => {
                self.presence
                    .announce(&UpdateMessage::Tick { remaining, mode });
                if self.questions[index].kind.tag() == KindTag::FreeText {
                    self.announce_histogram();
                }
            }
            TickOutcome::Expired => {
                self.presence
                    .announce(&UpdateMessage::Tick { remaining: 0, mode });
                info!(session = %self.code, index, "question expired");
                self.lock_question(index);
            }
            TickOutcome::Refresh => self.announce_histogram(),
        }
    }

    fn enter_question<S: FnMut(Schedule)>(&mut self, index: usize, schedule: &mut S) {
        let Some(question) = self.questions.get(index) else {
            self.complete();
            return;
        };
        let (id, time_allowed, view) = (question.id.clone(), question.time_allowed, question.view());

        self.timer.stop();
        self.ledger.advance_question(Some(id));
        self.typing.clear();
        self.graded.clear();
        self.histogram = None;
        self.set_phase(Phase::QuestionActive(index));

        info!(session = %self.code, index, "question started");

        self.presence.announce(&UpdateMessage::QuestionStarted {
            index,
            count: self.question_count(),
            question: view,
        });

        match self.timer.start(time_allowed, self.config.tick_interval) {
            Ok(countdown) => schedule(countdown),
            Err(error) => warn!(session = %self.code, %error, "countdown not started"),
        }

        self.announce_histogram();
    }

    fn lock_if_all_final(&mut self) {
        let Phase::QuestionActive(index) = self.phase else {
            return;
        };

        let players = self.presence.connected_ids(Role::Player).collect_vec();
        if players.is_empty() || !self.ledger.all_final(players) {
            return;
        }

        info!(session = %self.code, index, "all players finalized");
        self.lock_question(index);
    }

    fn lock_question(&mut self, index: usize) {
        self.timer.stop();
        self.ledger.lock();
        self.set_phase(Phase::QuestionLocked(index));

        let question = self.questions[index].id.clone();
        self.presence.announce(&UpdateMessage::QuestionLocked {
            question: question.clone(),
        });

        self.apply_scores(index);

        let histogram = self.compute_histogram(index);
        self.histogram = Some(histogram.clone());
        self.set_phase(Phase::ShowingResults(index));

        let standings = self.scoreboard.standings().to_vec();
        self.presence.announce_with(|id, role| {
            let is_player = role == Role::Player;
            Some(UpdateMessage::ResultsShown {
                question: question.clone(),
                answer: is_player.then(|| self.answer_result(id)).flatten(),
                score: is_player.then(|| self.scoreboard.score(id)),
                standings: standings.clone(),
                histogram: histogram.clone(),
            })
        });
    }

    fn apply_scores(&mut self, index: usize) {
        let question = &self.questions[index];
        let mut misconfigured = None;

        let outcomes = self
            .ledger
            .answers()
            .map(|(id, answer)| {
                let verdict = evaluator::evaluate(question, &answer.payload).unwrap_or_else(|error| {
                    misconfigured = Some(error);
                    Verdict::Ungraded
                });
                (id, verdict, answer.finalized, answer.updated_at)
            })
            .collect_vec();

        if let Some(error) = misconfigured {
            warn!(session = %self.code, question = %question.id, %error, "answers left ungraded");
        }

        let bonus = match question.kind {
            QuestionKind::Choice { .. } => {
                let earliest = outcomes
                    .iter()
                    .filter(|(_, verdict, finalized, _)| {
                        *verdict == Verdict::Correct && *finalized == Some(Finalization::Participant)
                    })
                    .min_set_by_key(|(_, _, _, at)| *at);
                match earliest.as_slice() {
                    [(id, ..)] => Some(*id),
                    _ => None,
                }
            }
            QuestionKind::FreeText | QuestionKind::NumericRange { .. } => None,
        };

        let mut scores = outcomes
            .iter()
            .map(|(id, verdict, ..)| {
                let points = evaluator::points_for(question, *verdict, bonus == Some(*id));
                self.ledger.record_outcome(*id, *verdict, points);
                (*id, points)
            })
            .collect_vec();

        let answered = scores.iter().map(|(id, _)| *id).collect::<HashSet<_>>();
        scores.extend(
            self.presence
                .ids(Role::Player)
                .filter(|id| !answered.contains(id))
                .map(|id| (id, 0)),
        );

        self.scoreboard.add_scores(question.id.clone(), &scores, bonus);
    }

    fn grade(&mut self, index: usize, participant: Id, grade: Grade) -> Result<(), Error> {
        let question = &self.questions[index];
        if question.kind.tag() != KindTag::FreeText {
            return Err(Error::InvalidPhase);
        }
        if !matches!(self.ledger.lookup(participant), Lookup::Final(_)) {
            return Err(Error::NotFound(Missing::Participant));
        }
        if !self.graded.insert(participant) {
            return Err(Error::AlreadyFinal);
        }

        let points = grade.points(question.points);
        let verdict = if grade == Grade::Zero {
            Verdict::Incorrect
        } else {
            Verdict::Correct
        };
        self.ledger.record_outcome(participant, verdict, points);
        self.scoreboard.add_points(participant, points);

        info!(session = %self.code, participant = %participant, ?grade, points, "answer graded");

        let message = UpdateMessage::Graded {
            participant,
            grade,
            points,
        };
        self.presence.announce_specific(Role::Manager, &message);
        self.presence.send_message(&message, participant);

        Ok(())
    }

    fn complete(&mut self) {
        self.timer.stop();
        self.ledger.advance_question(None);
        self.set_phase(Phase::MatchComplete);

        info!(session = %self.code, rounds = self.scoreboard.rounds(), "match complete");

        let summary = self.scoreboard.final_summary().clone();
        self.presence.announce(&UpdateMessage::MatchComplete(summary));
    }

    fn end_match(&mut self) {
        if self.phase != Phase::MatchComplete {
            self.complete();
        }
        self.ended = true;
    }

    fn compute_histogram(&self, index: usize) -> HistogramSnapshot {
        HistogramSnapshot::compute(
            &self.questions[index],
            &self.ledger,
            &self.typing,
            self.presence.connected_ids(Role::Player),
        )
    }

    fn announce_histogram(&mut self) {
        let Phase::QuestionActive(index) = self.phase else {
            return;
        };
        let snapshot = self.compute_histogram(index);
        self.presence
            .announce_specific(Role::Manager, &UpdateMessage::HistogramUpdate(snapshot.clone()));
        self.histogram = Some(snapshot);
    }

    fn announce_presence(&self) {
        self.presence
            .announce_specific(Role::Manager, &UpdateMessage::Presence(self.presence.roster()));
    }

    fn answer_result(&self, id: Id) -> Option<AnswerResult> {
        match self.ledger.lookup(id) {
            Lookup::NotFound => None,
            Lookup::Provisional(answer) | Lookup::Final(answer) => Some(AnswerResult {
                payload: answer.payload.clone(),
                verdict: answer.verdict,
                points: answer.points,
            }),
        }
    }

    /// Returns the message that brings a participant up to date
    pub fn state_message(&self, id: Id, role: Role) -> SyncMessage {
        let is_player = role == Role::Player;
        let count = self.question_count();

        match self.phase {
            Phase::Lobby => SyncMessage::Lobby {
                participants: self.presence.len(),
            },
            Phase::QuestionActive(index) => {
                let (answer, is_final) = match self.ledger.lookup(id) {
                    Lookup::NotFound => (None, false),
                    Lookup::Provisional(answer) => (Some(answer.payload.clone()), false),
                    Lookup::Final(answer) => (Some(answer.payload.clone()), true),
                };
                SyncMessage::Question {
                    index,
                    count,
                    question: self.questions[index].view(),
                    remaining: self.timer.remaining(),
                    mode: self.timer.mode(),
                    answer,
                    is_final,
                    score: is_player.then(|| self.scoreboard.score(id)),
                }
            }
            Phase::QuestionLocked(index) | Phase::ShowingResults(index) => SyncMessage::Results {
                index,
                count,
                question: self.questions[index].id.clone(),
                answer: is_player.then(|| self.answer_result(id)).flatten(),
                score: is_player.then(|| self.scoreboard.score(id)),
                standings: self.scoreboard.standings().to_vec(),
                histogram: self.histogram.clone(),
            },
            Phase::MatchComplete => SyncMessage::Complete(self.scoreboard.final_summary().clone()),
        }
    }

    /// Builds the read-only projection of the session
    pub fn view(&self) -> SessionView {
        SessionView {
            code: self.code,
            phase: self.phase,
            remaining: self.timer.remaining(),
            mode: self.timer.mode(),
            histogram: self.histogram.clone(),
            participants: self.presence.roster(),
            standings: self.scoreboard.standings().to_vec(),
        }
    }

    /// Whether anyone is connected
    pub fn any_connected(&self) -> bool {
        self.presence.any_connected()
    }

    /// Stops the timer and closes every tunnel
    pub fn close(&mut self) {
        self.timer.stop();
        self.presence.close_all();
        info!(session = %self.code, "session closed");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::{
        histogram::Distribution,
        question::tests::{choice_question, free_text_question, numeric_question},
        tunnel::mock::{Frame, MockTunnel},
    };

    struct Harness {
        session: Session<MockTunnel>,
        schedules: Vec<Schedule>,
        manager: Id,
        manager_tunnel: MockTunnel,
    }

    impl Harness {
        fn new(questions: Vec<Question>) -> Self {
            let mut session =
                Session::new(AccessCode::new(4321).unwrap(), questions, MatchConfig::default())
                    .unwrap();
            let manager = Id::new();
            let manager_tunnel = MockTunnel::default();
            session
                .join(manager, "Host".to_owned(), Role::Manager, manager_tunnel.clone())
                .unwrap();
            Self {
                session,
                schedules: Vec::new(),
                manager,
                manager_tunnel,
            }
        }

        fn player(&mut self, name: &str) -> (Id, MockTunnel) {
            let id = Id::new();
            let tunnel = MockTunnel::default();
            self.session
                .join(id, name.to_owned(), Role::Player, tunnel.clone())
                .unwrap();
            (id, tunnel)
        }

        fn manager(&mut self, message: IncomingManagerMessage) -> Result<(), Error> {
            let schedules = &mut self.schedules;
            self.session.receive_message(
                self.manager,
                IncomingMessage::Manager(message),
                |schedule| schedules.push(schedule),
            )
        }

        fn submit(&mut self, id: Id, question: &str, payload: AnswerPayload, is_final: bool) -> Result<(), Error> {
            let schedules = &mut self.schedules;
            self.session.receive_message(
                id,
                IncomingMessage::Player(IncomingPlayerMessage::SubmitAnswer {
                    question: question.into(),
                    payload,
                    is_final,
                }),
                |schedule| schedules.push(schedule),
            )
        }

        fn current_epoch(&self) -> u64 {
            self.schedules.last().unwrap().epoch
        }

        fn run_out_clock(&mut self) {
            let epoch = self.current_epoch();
            while matches!(self.session.phase(), Phase::QuestionActive(_)) {
                self.session.receive_wake(epoch);
            }
        }
    }

    fn choice(indices: &[usize]) -> AnswerPayload {
        AnswerPayload::Choice(indices.iter().copied().collect())
    }

    #[test]
    fn test_start_match_starts_countdown() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);

        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        assert_eq!(harness.session.phase(), Phase::QuestionActive(0));
        assert!(harness.session.timer().is_running());
        assert_eq!(harness.session.timer().remaining(), 20);
        assert_eq!(harness.schedules.len(), 1);
    }

    #[test]
    fn test_empty_match_completes_immediately() {
        let mut harness = Harness::new(Vec::new());
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        assert_eq!(harness.session.phase(), Phase::MatchComplete);
    }

    #[test]
    fn test_expiry_freezes_provisional_answers() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (p1, _) = harness.player("Ada");
        let (p2, p2_tunnel) = harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness.submit(p1, "q1", choice(&[0]), true).unwrap();
        harness.submit(p2, "q1", choice(&[1]), false).unwrap();
        p2_tunnel.drain();

        harness.run_out_clock();

        assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
        let Lookup::Final(answer) = harness.session.ledger().lookup(p2) else {
            panic!("expected frozen answer");
        };
        assert_eq!(answer.payload, choice(&[1]));
        assert_eq!(answer.finalized, Some(Finalization::Deadline));
        assert_eq!(answer.verdict, Some(Verdict::Incorrect));

        assert_eq!(
            harness.submit(p2, "q1", choice(&[0]), true),
            Err(Error::TooLate)
        );
        let Lookup::Final(answer) = harness.session.ledger().lookup(p2) else {
            panic!("expected frozen answer");
        };
        assert_eq!(answer.payload, choice(&[1]));

        let updates = p2_tunnel.updates();
        assert!(matches!(
            updates.iter().rev().nth(1),
            Some(UpdateMessage::QuestionLocked { .. })
        ));
        assert!(matches!(
            updates.last(),
            Some(UpdateMessage::ResultsShown { answer: Some(_), score: Some(_), .. })
        ));
    }

    #[test]
    fn test_expiry_with_silent_player() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (answered, _) = harness.player("Ada");
        let (silent, _) = harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness.submit(answered, "q1", choice(&[0]), true).unwrap();
        assert_eq!(harness.session.phase(), Phase::QuestionActive(0));

        harness.run_out_clock();

        assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
        assert_eq!(harness.session.ledger().lookup(silent), Lookup::NotFound);
        let Lookup::Final(answer) = harness.session.ledger().lookup(answered) else {
            panic!("expected final answer");
        };
        assert_eq!(answer.verdict, Some(Verdict::Correct));

        let scoreboard = harness.session.scoreboard();
        assert_eq!(scoreboard.score(answered).points, 24);
        assert_eq!(scoreboard.score(answered).bonus_count, 1);
        assert_eq!(scoreboard.score(silent).points, 0);

        let histogram = harness.session.view().histogram.unwrap();
        assert_eq!(histogram.finalized, 1);
        assert_eq!(histogram.total, 1);
        assert_eq!(
            histogram.distribution,
            Distribution::Choice {
                counts: vec![1, 0, 0, 0]
            }
        );
    }

    #[test]
    fn test_join_after_lock_gets_results() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        harness.submit(player, "q1", choice(&[0]), true).unwrap();

        let observer = Id::new();
        let tunnel = MockTunnel::default();
        harness
            .session
            .join(observer, "Watcher".to_owned(), Role::Observer, tunnel.clone())
            .unwrap();

        assert!(matches!(
            tunnel.drain().first(),
            Some(Frame::Sync(SyncMessage::Results { index: 0, answer: None, score: None, .. }))
        ));
    }

    #[test]
    fn test_ticks_are_monotone() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (_, tunnel) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        tunnel.drain();

        harness.run_out_clock();

        let remaining = tunnel
            .updates()
            .into_iter()
            .filter_map(|update| match update {
                UpdateMessage::Tick { remaining, .. } => Some(remaining),
                _ => None,
            })
            .collect_vec();
        assert_eq!(remaining, (0..20).rev().collect_vec());
    }

    #[test]
    fn test_advance_rejected_while_active() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        assert_eq!(
            harness.manager(IncomingManagerMessage::Advance),
            Err(Error::InvalidPhase)
        );
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        assert_eq!(
            harness.manager(IncomingManagerMessage::Advance),
            Err(Error::InvalidPhase)
        );
    }

    #[test]
    fn test_all_final_locks_early() {
        let mut harness = Harness::new(vec![
            choice_question("q1", &[0]),
            choice_question("q2", &[1]),
        ]);
        let (p1, _) = harness.player("Ada");
        let (p2, _) = harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        let first_countdown = harness.schedules[0].token.clone();

        harness.submit(p1, "q1", choice(&[0]), true).unwrap();
        assert_eq!(harness.session.phase(), Phase::QuestionActive(0));
        harness.submit(p2, "q1", choice(&[1]), true).unwrap();

        assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
        assert!(first_countdown.is_cancelled());

        harness.manager(IncomingManagerMessage::Advance).unwrap();
        assert_eq!(harness.session.phase(), Phase::QuestionActive(1));
        assert_eq!(
            harness.submit(p1, "q1", choice(&[0]), true),
            Err(Error::TooLate)
        );
    }

    #[test]
    fn test_disconnected_players_do_not_hold_the_lock() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (p1, _) = harness.player("Ada");
        let (p2, _) = harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness.submit(p1, "q1", choice(&[0]), true).unwrap();
        harness.session.disconnect(p2).unwrap();

        assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
    }

    #[test]
    fn test_roles_are_enforced() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let observer = Id::new();
        harness
            .session
            .join(observer, "Watcher".to_owned(), Role::Observer, MockTunnel::default())
            .unwrap();
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        assert_eq!(
            harness.submit(observer, "q1", choice(&[0]), true),
            Err(Error::NotPermitted)
        );
        assert_eq!(
            harness.session.receive_message(
                player,
                IncomingMessage::Manager(IncomingManagerMessage::Advance),
                |_| panic!("no schedule expected"),
            ),
            Err(Error::NotPermitted)
        );
        assert_eq!(
            harness.session.receive_message(
                player,
                IncomingMessage::Manager(IncomingManagerMessage::StartTimer(30)),
                |_| panic!("no schedule expected"),
            ),
            Ok(())
        );
        assert_eq!(
            harness.submit(Id::new(), "q1", choice(&[0]), true),
            Err(Error::NotFound(Missing::Participant))
        );
    }

    #[test]
    fn test_submission_errors() {
        let mut harness = Harness::new(vec![
            choice_question("q1", &[0]),
            choice_question("q2", &[0]),
        ]);
        let (player, _) = harness.player("Ada");

        assert_eq!(
            harness.submit(player, "q1", choice(&[0]), false),
            Err(Error::InvalidPhase)
        );

        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        assert_eq!(
            harness.submit(player, "nope", choice(&[0]), false),
            Err(Error::NotFound(Missing::Question))
        );
        assert_eq!(
            harness.submit(player, "q2", choice(&[0]), false),
            Err(Error::InvalidPhase)
        );
        assert_eq!(
            harness.submit(player, "q1", AnswerPayload::Numeric(1.), false),
            Err(Error::InvalidPayload)
        );
        harness.submit(player, "q1", choice(&[0]), false).unwrap();
        harness.submit(player, "q1", choice(&[1]), false).unwrap();
        assert_eq!(harness.session.ledger().len(), 1);
    }

    #[test]
    fn test_timer_commands() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        assert_eq!(
            harness.manager(IncomingManagerMessage::StartTimer(30)),
            Err(Error::TimerAlreadyRunning)
        );

        let epoch = harness.current_epoch();
        harness.session.receive_wake(epoch);
        harness.manager(IncomingManagerMessage::EnterPanicMode).unwrap();
        assert_eq!(harness.session.timer().remaining(), 19);
        assert_eq!(harness.session.timer().mode(), Some(TimerMode::Panic));

        harness.manager(IncomingManagerMessage::StopTimer).unwrap();
        let stale = harness.current_epoch();
        harness.session.receive_wake(stale);
        assert_eq!(harness.session.timer().remaining(), 19);
        assert_eq!(
            harness.manager(IncomingManagerMessage::EnterPanicMode),
            Err(Error::TimerNotRunning)
        );

        harness.manager(IncomingManagerMessage::ResumeTimer).unwrap();
        harness.session.receive_wake(stale);
        assert_eq!(harness.session.timer().remaining(), 19);
        let resumed = harness.current_epoch();
        harness.session.receive_wake(resumed);
        assert_eq!(harness.session.timer().remaining(), 18);
    }

    #[test]
    fn test_first_correct_bonus() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0, 2])]);
        let (first, _) = harness.player("Ada");
        let (second, _) = harness.player("Grace");
        let (wrong, _) = harness.player("Linus");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness.submit(first, "q1", choice(&[0, 2]), true).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        harness.submit(second, "q1", choice(&[2, 0]), true).unwrap();
        harness.submit(wrong, "q1", choice(&[0]), true).unwrap();

        let scoreboard = harness.session.scoreboard();
        assert_eq!(scoreboard.score(first).points, 24);
        assert_eq!(scoreboard.score(first).bonus_count, 1);
        assert_eq!(scoreboard.score(second).points, 20);
        assert_eq!(scoreboard.score(second).bonus_count, 0);
        assert_eq!(scoreboard.score(wrong).points, 0);
        assert_eq!(scoreboard.standings().len(), 3);
    }

    #[test]
    fn test_misconfigured_numeric_is_ungraded() {
        for question in [
            numeric_question("q1", Some(10.), None, Some(2.)),
            numeric_question("q1", Some(20.), Some(10.), Some(2.)),
            numeric_question("q1", Some(10.), Some(20.), Some(-1.)),
        ] {
            let mut harness = Harness::new(vec![question]);
            let (player, _) = harness.player("Ada");
            harness.manager(IncomingManagerMessage::StartMatch).unwrap();

            harness
                .submit(player, "q1", AnswerPayload::Numeric(15.), true)
                .unwrap();

            assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
            let Lookup::Final(answer) = harness.session.ledger().lookup(player) else {
                panic!("expected final answer");
            };
            assert_eq!(answer.verdict, Some(Verdict::Ungraded));
            assert_eq!(harness.session.scoreboard().score(player).points, 0);
        }
    }

    #[test]
    fn test_numeric_scoring() {
        let mut harness = Harness::new(vec![numeric_question("q1", Some(10.), Some(20.), Some(2.))]);
        let (inside, _) = harness.player("Ada");
        let (outside, _) = harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness
            .submit(inside, "q1", AnswerPayload::Numeric(15.), true)
            .unwrap();
        harness
            .submit(outside, "q1", AnswerPayload::Numeric(25.), true)
            .unwrap();

        let scoreboard = harness.session.scoreboard();
        assert_eq!(scoreboard.score(inside).points, 40);
        assert_eq!(scoreboard.score(inside).bonus_count, 0);
        assert_eq!(scoreboard.score(outside).points, 0);
    }

    #[test]
    fn test_free_text_grading_applies_once() {
        let mut harness = Harness::new(vec![free_text_question("q1")]);
        let (player, tunnel) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness
            .submit(player, "q1", AnswerPayload::Text("moves".to_owned()), true)
            .unwrap();
        assert_eq!(harness.session.phase(), Phase::ShowingResults(0));
        assert_eq!(harness.session.scoreboard().score(player).points, 0);
        tunnel.drain();

        harness
            .manager(IncomingManagerMessage::Grade {
                participant: player,
                grade: Grade::Half,
            })
            .unwrap();
        assert_eq!(
            harness.manager(IncomingManagerMessage::Grade {
                participant: player,
                grade: Grade::Full,
            }),
            Err(Error::AlreadyFinal)
        );
        assert_eq!(
            harness.manager(IncomingManagerMessage::Grade {
                participant: Id::new(),
                grade: Grade::Full,
            }),
            Err(Error::NotFound(Missing::Participant))
        );

        assert_eq!(harness.session.scoreboard().score(player).points, 25);
        assert!(matches!(
            tunnel.updates().as_slice(),
            [UpdateMessage::Graded { points: 25, .. }]
        ));
    }

    #[test]
    fn test_grading_choice_question_rejected() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        harness.submit(player, "q1", choice(&[0]), true).unwrap();

        assert_eq!(
            harness.manager(IncomingManagerMessage::Grade {
                participant: player,
                grade: Grade::Full,
            }),
            Err(Error::InvalidPhase)
        );
    }

    #[test]
    fn test_free_text_stop_keeps_refreshing_activity() {
        let mut harness = Harness::new(vec![free_text_question("q1")]);
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();

        harness
            .session
            .receive_message(
                player,
                IncomingMessage::Player(IncomingPlayerMessage::SetTypingState(true)),
                |_| (),
            )
            .unwrap();
        harness.manager(IncomingManagerMessage::StopTimer).unwrap();
        assert_eq!(harness.session.timer().mode(), Some(TimerMode::Histogram));
        harness.manager_tunnel.drain();

        let epoch = harness.current_epoch();
        for _ in 0..5 {
            harness.session.receive_wake(epoch);
        }

        assert_eq!(harness.session.phase(), Phase::QuestionActive(0));
        assert_eq!(harness.session.timer().remaining(), 60);
        let Some(UpdateMessage::HistogramUpdate(snapshot)) = harness.manager_tunnel.updates().pop() else {
            panic!("expected histogram update");
        };
        assert_eq!(
            snapshot.distribution,
            Distribution::FreeText { active: 0, idle: 1 }
        );
    }

    #[test]
    fn test_manager_receives_histogram_updates() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (player, player_tunnel) = harness.player("Ada");
        harness.player("Grace");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        harness.manager_tunnel.drain();
        player_tunnel.drain();

        harness.submit(player, "q1", choice(&[1]), false).unwrap();

        let Some(UpdateMessage::HistogramUpdate(snapshot)) = harness.manager_tunnel.updates().pop() else {
            panic!("expected histogram update");
        };
        assert_eq!(
            snapshot.distribution,
            Distribution::Choice {
                counts: vec![0, 1, 0, 0]
            }
        );
        assert!(player_tunnel.updates().is_empty());
    }

    #[test]
    fn test_rejoin_restores_score_and_syncs() {
        let mut harness = Harness::new(vec![
            choice_question("q1", &[0]),
            choice_question("q2", &[0]),
        ]);
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        harness.submit(player, "q1", choice(&[0]), true).unwrap();
        harness.manager(IncomingManagerMessage::Advance).unwrap();

        harness.session.disconnect(player).unwrap();
        let tunnel = MockTunnel::default();
        harness
            .session
            .join(player, "Ada".to_owned(), Role::Player, tunnel.clone())
            .unwrap();

        let frames = tunnel.drain();
        let Some(Frame::Sync(SyncMessage::Question { index, score, .. })) = frames.first() else {
            panic!("expected question sync");
        };
        assert_eq!(*index, 1);
        assert_eq!(score.map(|s| s.points), Some(24));
        assert_eq!(harness.session.presence().role(player), Some(Role::Player));
    }

    #[test]
    fn test_end_match() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (_, tunnel) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        let countdown = harness.schedules[0].token.clone();
        tunnel.drain();

        harness.manager(IncomingManagerMessage::EndMatch).unwrap();

        assert!(harness.session.is_ended());
        assert_eq!(harness.session.phase(), Phase::MatchComplete);
        assert!(countdown.is_cancelled());
        assert!(matches!(
            tunnel.updates().as_slice(),
            [UpdateMessage::MatchComplete(_)]
        ));

        harness.session.close();
        assert!(tunnel.is_closed());
    }

    #[test]
    fn test_advance_past_last_question_completes() {
        let mut harness = Harness::new(vec![choice_question("q1", &[0])]);
        let (player, _) = harness.player("Ada");
        harness.manager(IncomingManagerMessage::StartMatch).unwrap();
        harness.submit(player, "q1", choice(&[0]), true).unwrap();

        harness.manager(IncomingManagerMessage::Advance).unwrap();

        assert_eq!(harness.session.phase(), Phase::MatchComplete);
        assert!(!harness.session.is_ended());
        assert!(harness.session.ledger().archived(&"q1".into()).is_some());
        let summary = harness.session.scoreboard().final_summary();
        assert_eq!(summary.stats.len(), 1);
        assert_eq!(summary.stats[0].earned, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MatchConfig {
            typing_idle_ticks: 0,
            ..MatchConfig::default()
        };
        assert!(matches!(
            Session::<MockTunnel>::new(AccessCode::new(1).unwrap(), Vec::new(), config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
