//! Live answer histogram
//!
//! A [`HistogramSnapshot`] is a derived projection of the ledger for the
//! question being played. It is recomputed after every mutation and pushed
//! to the manager; nothing here is persisted.

use std::collections::HashMap;

use itertools::Itertools;
use serde::Serialize;

use crate::{
    answer::{AnswerPayload, Ledger},
    constants,
    presence::Id,
    question::{Question, QuestionId, QuestionKind},
};

/// Distribution of answers for one question kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Distribution {
    /// Number of answers that selected each option
    Choice {
        /// One count per option, in display order
        counts: Vec<usize>,
    },
    /// Numeric answers grouped in equal-width buckets over the bounds
    Numeric {
        /// Start of each bucket
        edges: Vec<f64>,
        /// Number of answers per bucket
        counts: Vec<usize>,
    },
    /// Typing activity for free-text questions
    FreeText {
        /// Players who typed recently
        active: usize,
        /// Players who did not
        idle: usize,
    },
}

/// The histogram of the question being played
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    /// Question the snapshot describes
    pub question: QuestionId,
    /// The distribution itself
    pub distribution: Distribution,
    /// Number of frozen answers
    pub finalized: usize,
    /// Number of answers, frozen or not
    pub total: usize,
}

/// Typing hints for free-text questions
///
/// A hint ages by one on every timer wake-up. A player counts as active
/// while their hint is younger than the configured idle threshold.
#[derive(Debug, Clone, Default)]
pub struct TypingTracker {
    idle_after: u32,
    hints: HashMap<Id, u32>,
}

impl TypingTracker {
    /// Creates a tracker that marks players idle after `idle_after` wake-ups
    pub fn new(idle_after: u32) -> Self {
        Self {
            idle_after,
            hints: HashMap::new(),
        }
    }

    /// Records a typing hint from a player
    pub fn set(&mut self, player: Id, typing: bool) {
        if typing {
            self.hints.insert(player, 0);
        } else {
            self.hints.remove(&player);
        }
    }

    /// Ages every hint by one wake-up
    pub fn age(&mut self) {
        for age in self.hints.values_mut() {
            *age = age.saturating_add(1);
        }
    }

    /// Whether the player typed recently
    pub fn is_active(&self, player: Id) -> bool {
        self.hints.get(&player).is_some_and(|age| *age < self.idle_after)
    }

    /// Forgets every hint, used when a new question starts
    pub fn clear(&mut self) {
        self.hints.clear();
    }
}

impl HistogramSnapshot {
    /// Recomputes the histogram from the ledger
    ///
    /// `players` is the set of players whose typing activity is reported for
    /// free-text questions.
    pub fn compute<I>(question: &Question, ledger: &Ledger, typing: &TypingTracker, players: I) -> Self
    where
        I: IntoIterator<Item = Id>,
    {
        let distribution = match &question.kind {
            QuestionKind::Choice { choices } => {
                let mut counts = vec![0; choices.len()];
                for (_, answer) in ledger.answers() {
                    if let AnswerPayload::Choice(selected) = &answer.payload {
                        for index in selected {
                            if let Some(count) = counts.get_mut(*index) {
                                *count += 1;
                            }
                        }
                    }
                }
                Distribution::Choice { counts }
            }
            QuestionKind::NumericRange {
                lower_bound,
                upper_bound,
                ..
            } => numeric_distribution(*lower_bound, *upper_bound, ledger),
            QuestionKind::FreeText => {
                let (active, idle) = players
                    .into_iter()
                    .fold((0, 0), |(active, idle), player| {
                        if typing.is_active(player) {
                            (active + 1, idle)
                        } else {
                            (active, idle + 1)
                        }
                    });
                Distribution::FreeText { active, idle }
            }
        };

        Self {
            question: question.id.clone(),
            distribution,
            finalized: ledger.finalized_count(),
            total: ledger.len(),
        }
    }
}

fn numeric_distribution(lower: Option<f64>, upper: Option<f64>, ledger: &Ledger) -> Distribution {
    let (Some(lower), Some(upper)) = (lower, upper) else {
        return Distribution::Numeric {
            edges: Vec::new(),
            counts: Vec::new(),
        };
    };

    let buckets = constants::scoring::NUMERIC_BUCKETS;
    let width = (upper - lower) / buckets as f64;
    let edges = (0..buckets)
        .map(|i| lower + width * i as f64)
        .collect_vec();
    let mut counts = vec![0; buckets];

    for (_, answer) in ledger.answers() {
        let AnswerPayload::Numeric(value) = answer.payload else {
            continue;
        };
        if value < lower || value > upper {
            continue;
        }
        let index = if width > 0.0 {
            (((value - lower) / width).floor() as usize).min(buckets - 1)
        } else {
            0
        };
        counts[index] += 1;
    }

    Distribution::Numeric { edges, counts }
}
