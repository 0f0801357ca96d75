//! Running scores
//!
//! The scoreboard records the points each player earned on each question,
//! keeps standings sorted, and computes a final summary once the match is
//! complete. Scores are keyed by participant id, so a player who leaves and
//! rejoins keeps everything they earned.

use std::collections::HashMap;

use itertools::Itertools;
use serde::Serialize;

use crate::{presence::Id, question::QuestionId};

/// A player's standing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Standing {
    /// Player id
    pub id: Id,
    /// Total points
    pub points: u64,
    /// Number of first-correct bonuses earned
    pub bonus_count: u32,
}

/// Score information sent to a single player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreMessage {
    /// Total points earned
    pub points: u64,
    /// Number of first-correct bonuses earned
    pub bonus_count: u32,
    /// Position in the standings (0-indexed), if the player scored at all
    pub position: Option<usize>,
}

/// Statistics for one question, computed at the end of the match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionStats {
    /// The question
    pub question: QuestionId,
    /// Players who earned points
    pub earned: usize,
    /// Players who answered but earned nothing
    pub missed: usize,
}

/// Summary of a completed match
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalSummary {
    /// Per-question statistics, in play order
    pub stats: Vec<QuestionStats>,
    /// Final standings, best first
    pub standings: Vec<Standing>,
}

/// Scores for one session
#[derive(Debug, Default)]
pub struct Scoreboard {
    /// Points earned by each player on each question, in play order
    points_earned: Vec<(QuestionId, HashMap<Id, u64>)>,
    totals: HashMap<Id, u64>,
    bonuses: HashMap<Id, u32>,
    /// Current standings (cached)
    standings: Vec<Standing>,
    final_summary: once_cell_serde::sync::OnceCell<FinalSummary>,
}

impl Scoreboard {
    /// Records the points of one question and refreshes the standings
    ///
    /// `bonus` names the player who earned the first-correct bonus, if any.
    pub fn add_scores(&mut self, question: QuestionId, scores: &[(Id, u64)], bonus: Option<Id>) {
        for (id, points) in scores {
            *self.totals.entry(*id).or_default() += points;
        }
        if let Some(id) = bonus {
            *self.bonuses.entry(id).or_default() += 1;
        }
        self.points_earned
            .push((question, scores.iter().copied().collect()));
        self.refresh();
    }

    /// Adds points to a player on the most recent question
    ///
    /// Used for manual grading after results are shown.
    pub fn add_points(&mut self, id: Id, points: u64) {
        if let Some((_, round)) = self.points_earned.last_mut() {
            *round.entry(id).or_default() += points;
        }
        *self.totals.entry(id).or_default() += points;
        self.refresh();
    }

    fn refresh(&mut self) {
        self.standings = self
            .totals
            .iter()
            .map(|(id, points)| Standing {
                id: *id,
                points: *points,
                bonus_count: self.bonuses.get(id).copied().unwrap_or_default(),
            })
            .sorted_by(|a, b| b.points.cmp(&a.points).then(a.id.cmp(&b.id)))
            .collect_vec();
    }

    /// Current standings, best first
    pub fn standings(&self) -> &[Standing] {
        &self.standings
    }

    /// Score information for one player
    pub fn score(&self, id: Id) -> ScoreMessage {
        ScoreMessage {
            points: self.totals.get(&id).copied().unwrap_or_default(),
            bonus_count: self.bonuses.get(&id).copied().unwrap_or_default(),
            position: self.standings.iter().position(|s| s.id == id),
        }
    }

    /// Number of questions scored so far
    pub fn rounds(&self) -> usize {
        self.points_earned.len()
    }

    fn compute_final_summary(&self) -> FinalSummary {
        FinalSummary {
            stats: self
                .points_earned
                .iter()
                .map(|(question, round)| {
                    let earned = round.values().filter(|points| **points > 0).count();
                    QuestionStats {
                        question: question.clone(),
                        earned,
                        missed: round.len() - earned,
                    }
                })
                .collect_vec(),
            standings: self.standings.clone(),
        }
    }

    /// The final summary, computed on first access and cached
    pub fn final_summary(&self) -> &FinalSummary {
        self.final_summary
            .get_or_init(|| self.compute_final_summary())
    }
}
