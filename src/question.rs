//! Question model and structural validation
//!
//! Questions are authored by an external collaborator and handed to the
//! engine when a session is created. They never change while the session
//! runs. Structural problems (text too long, too many options, time limits
//! out of range) reject the whole match up front; missing numeric bounds are
//! tolerated here and surface as a configuration error at evaluation time.

use garde::Validate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::constants;

/// Identifier of a question within a match
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct QuestionId(pub String);

impl From<&str> for QuestionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// One option of a choice question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Choice {
    /// Text shown to players
    #[garde(length(max = constants::question::MAX_CHOICE_LENGTH))]
    pub text: String,
    /// Whether selecting this option is part of the correct answer
    #[garde(skip)]
    pub is_correct: bool,
}

/// The three evaluation kinds
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub enum QuestionKind {
    /// One or more correct options out of an ordered list
    Choice {
        /// Options in display order
        #[garde(length(min = constants::question::MIN_CHOICE_COUNT, max = constants::question::MAX_CHOICE_COUNT), dive)]
        choices: Vec<Choice>,
    },
    /// Free text, graded by the manager after the fact
    FreeText,
    /// A numeric value checked against bounds and a tolerance
    NumericRange {
        /// Smallest accepted value
        #[garde(skip)]
        lower_bound: Option<f64>,
        /// Largest accepted value
        #[garde(skip)]
        upper_bound: Option<f64>,
        /// Half-width of the accepted interval around the submitted value
        #[garde(skip)]
        tolerance: Option<f64>,
    },
}

/// Discriminant of [`QuestionKind`] without its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KindTag {
    /// See [`QuestionKind::Choice`]
    Choice,
    /// See [`QuestionKind::FreeText`]
    FreeText,
    /// See [`QuestionKind::NumericRange`]
    NumericRange,
}

impl QuestionKind {
    /// Returns the kind without its associated data
    pub fn tag(&self) -> KindTag {
        match self {
            Self::Choice { .. } => KindTag::Choice,
            Self::FreeText => KindTag::FreeText,
            Self::NumericRange { .. } => KindTag::NumericRange,
        }
    }
}

/// A question as played in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Question {
    /// Identifier used by submissions
    #[garde(length(min = 1))]
    pub id: QuestionId,
    /// The question text
    #[garde(length(min = constants::question::MIN_TEXT_LENGTH, max = constants::question::MAX_TEXT_LENGTH))]
    pub text: String,
    /// Points awarded for a correct answer
    #[garde(range(min = constants::question::MIN_POINTS, max = constants::question::MAX_POINTS))]
    pub points: u64,
    /// Countdown duration in seconds
    #[garde(range(min = constants::question::MIN_TIME_ALLOWED, max = constants::question::MAX_TIME_ALLOWED))]
    pub time_allowed: u32,
    /// Evaluation kind and its data
    #[garde(dive)]
    pub kind: QuestionKind,
}

impl garde::rules::length::HasSimpleLength for QuestionId {
    fn length(&self) -> usize {
        self.0.len()
    }
}

/// What players and observers see of a question (no correctness flags)
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionView {
    /// Identifier used by submissions
    pub id: QuestionId,
    /// The question text
    pub text: String,
    /// Points awarded for a correct answer
    pub points: u64,
    /// Countdown duration in seconds
    pub time_allowed: u32,
    /// Evaluation kind
    pub kind: KindTag,
    /// Option texts for choice questions
    pub choices: Option<Vec<String>>,
    /// Slider bounds for numeric-range questions
    pub bounds: Option<(f64, f64)>,
}

impl Question {
    /// Projects the question for display, hiding which options are correct
    pub fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id.clone(),
            text: self.text.clone(),
            points: self.points,
            time_allowed: self.time_allowed,
            kind: self.kind.tag(),
            choices: match &self.kind {
                QuestionKind::Choice { choices } => {
                    Some(choices.iter().map(|c| c.text.clone()).collect_vec())
                }
                _ => None,
            },
            bounds: match self.kind {
                QuestionKind::NumericRange {
                    lower_bound: Some(lower),
                    upper_bound: Some(upper),
                    ..
                } => Some((lower, upper)),
                _ => None,
            },
        }
    }
}

/// Validates every question of a match
///
/// # Errors
///
/// Returns [`crate::Error::InvalidConfig`] naming the first offending question.
pub fn validate_all(questions: &[Question]) -> Result<(), crate::Error> {
    if questions.len() > constants::session::MAX_QUESTION_COUNT {
        return Err(crate::Error::InvalidConfig(format!(
            "a match holds at most {} questions",
            constants::session::MAX_QUESTION_COUNT
        )));
    }
    if !questions.iter().map(|q| &q.id).all_unique() {
        return Err(crate::Error::InvalidConfig(
            "question ids must be unique".to_owned(),
        ));
    }
    for question in questions {
        question
            .validate()
            .map_err(|report| crate::Error::InvalidConfig(format!("{}: {report}", question.id)))?;
    }
    Ok(())
}
