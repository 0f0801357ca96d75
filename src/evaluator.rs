//! Answer evaluation and scoring
//!
//! Pure functions with no I/O. Each question kind has its own correctness
//! rule; free text is never graded automatically and instead receives a
//! [`Grade`] from the manager once results are shown.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    answer::AnswerPayload,
    constants,
    question::{Choice, Question, QuestionKind},
};

/// Outcome of evaluating one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// The answer matches
    Correct,
    /// The answer does not match
    Incorrect,
    /// No automatic verdict (free text, or a misconfigured question)
    Ungraded,
}

/// Manual grade for a free-text answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    /// No points
    Zero,
    /// Half the question's points
    Half,
    /// All of the question's points
    Full,
}

impl Grade {
    /// Points earned for a question worth `points`
    pub fn points(self, points: u64) -> u64 {
        match self {
            Self::Zero => 0,
            Self::Half => points / 2,
            Self::Full => points,
        }
    }
}

/// Checks that a payload fits the question it targets
///
/// # Errors
///
/// Returns [`Error::InvalidPayload`] if the payload kind differs from the
/// question kind, a choice index is out of range, a text is too long, or a
/// number is not finite.
pub fn check_payload(question: &Question, payload: &AnswerPayload) -> Result<(), Error> {
    let fits = match (&question.kind, payload) {
        (QuestionKind::Choice { choices }, AnswerPayload::Choice(selected)) => {
            selected.iter().all(|index| *index < choices.len())
        }
        (QuestionKind::FreeText, AnswerPayload::Text(text)) => {
            text.chars().count() <= constants::question::MAX_FREE_TEXT_LENGTH
        }
        (QuestionKind::NumericRange { .. }, AnswerPayload::Numeric(value)) => value.is_finite(),
        _ => false,
    };

    if fits { Ok(()) } else { Err(Error::InvalidPayload) }
}

/// Evaluates a payload against its question
///
/// # Errors
///
/// * [`Error::InvalidPayload`] if the payload does not fit the question
/// * [`Error::Configuration`] if a numeric-range question lacks a bound or
///   its tolerance
pub fn evaluate(question: &Question, payload: &AnswerPayload) -> Result<Verdict, Error> {
    check_payload(question, payload)?;

    match (&question.kind, payload) {
        (QuestionKind::Choice { choices }, AnswerPayload::Choice(selected)) => {
            Ok(evaluate_choice(choices, selected))
        }
        (
            QuestionKind::NumericRange {
                lower_bound,
                upper_bound,
                tolerance,
            },
            AnswerPayload::Numeric(value),
        ) => evaluate_numeric(*lower_bound, *upper_bound, *tolerance, *value),
        (QuestionKind::FreeText, AnswerPayload::Text(_)) => Ok(Verdict::Ungraded),
        _ => Err(Error::InvalidPayload),
    }
}

/// Correct iff the selected set equals the set of options flagged correct
pub fn evaluate_choice(choices: &[Choice], selected: &BTreeSet<usize>) -> Verdict {
    let expected = choices
        .iter()
        .enumerate()
        .filter(|(_, choice)| choice.is_correct)
        .map(|(index, _)| index)
        .collect::<BTreeSet<_>>();

    if &expected == selected {
        Verdict::Correct
    } else {
        Verdict::Incorrect
    }
}

/// Checks a numeric value against bounds and a tolerance
///
/// A value outside `[lower, upper]` is incorrect. Otherwise the accepted
/// interval is the intersection of `[lower, upper]` with
/// `[value - tolerance, value + tolerance]`, and the value must lie in it.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if any of the three parameters is
/// missing, the bounds are inverted, or the tolerance is negative.
pub fn evaluate_numeric(
    lower_bound: Option<f64>,
    upper_bound: Option<f64>,
    tolerance: Option<f64>,
    value: f64,
) -> Result<Verdict, Error> {
    let (Some(lower), Some(upper), Some(tolerance)) = (lower_bound, upper_bound, tolerance) else {
        return Err(Error::Configuration(
            "numeric range needs a lower bound, an upper bound and a tolerance".to_owned(),
        ));
    };

    if lower > upper {
        return Err(Error::Configuration(format!(
            "lower bound {lower} is above upper bound {upper}"
        )));
    }
    if tolerance < 0. {
        return Err(Error::Configuration(format!(
            "tolerance {tolerance} is negative"
        )));
    }

    if value < lower || value > upper {
        return Ok(Verdict::Incorrect);
    }

    let valid_min = lower.max(value - tolerance);
    let valid_max = upper.min(value + tolerance);

    if (valid_min..=valid_max).contains(&value) {
        Ok(Verdict::Correct)
    } else {
        Ok(Verdict::Incorrect)
    }
}

/// Points for an evaluated answer
///
/// `first_correct` applies the bonus multiplier; callers only set it for the
/// single earliest correct choice answer.
pub fn points_for(question: &Question, verdict: Verdict, first_correct: bool) -> u64 {
    match verdict {
        Verdict::Correct if first_correct => {
            (question.points as f64 * constants::scoring::BONUS_MULTIPLIER).round() as u64
        }
        Verdict::Correct => question.points,
        Verdict::Incorrect | Verdict::Ungraded => 0,
    }
}
