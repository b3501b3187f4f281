// Resolution-time scoring: per-user Brier error, completion, consensus, and
// miscalibration flags.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::group::{TruthValue, UserId};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// Who a score belongs to: a real user or the synthetic consensus forecaster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Participant {
    User(UserId),
    Consensus,
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Participant::User(id) => f.write_str(id),
            Participant::Consensus => f.write_str("consensus"),
        }
    }
}

/// Calibration result for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    /// Mean squared error over the scored questions, `None` when nothing
    /// could be scored.
    pub error: Option<f64>,
    /// Fraction of the group's questions answered, regardless of truth value.
    pub completion: f64,
    /// Number of answered questions whose truth was not `Unknown`.
    pub scored: usize,
}

/// A question the group as a whole got on the wrong side of 50%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiscalibrationFlag {
    pub question: String,
    pub consensus: f64,
    pub truth: TruthValue,
}

/// Everything computed when a group is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub user_scores: BTreeMap<UserId, Score>,
    pub consensus_score: Score,
    /// Mean probability per question; absent when nobody answered it.
    pub consensus_values: BTreeMap<String, f64>,
    pub flags: Vec<MiscalibrationFlag>,
}

impl Resolution {
    /// Look up a participant's score.
    pub fn score_of(&self, participant: &Participant) -> Option<&Score> {
        match participant {
            Participant::User(id) => self.user_scores.get(id),
            Participant::Consensus => Some(&self.consensus_score),
        }
    }

    /// All users plus the consensus entry, ranked by ascending error.
    ///
    /// Participants without a defined error sort last. Ties are broken by
    /// participant so the order is deterministic.
    pub fn ranking(&self) -> Vec<(Participant, Score)> {
        let mut entries: Vec<(Participant, Score)> = self
            .user_scores
            .iter()
            .map(|(id, score)| (Participant::User(id.clone()), *score))
            .chain(std::iter::once((Participant::Consensus, self.consensus_score)))
            .collect();
        entries.sort_by(|(pa, a), (pb, b)| compare_errors(a.error, b.error).then_with(|| pa.cmp(pb)));
        entries
    }
}

fn compare_errors(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Squared distance between a probability and a binary outcome.
pub fn brier(probability: f64, outcome: f64) -> f64 {
    (probability - outcome).powi(2)
}

/// Score one forecaster's answers against the truths.
///
/// Questions resolved as `Unknown` count toward completion but never toward
/// the error sum or its denominator.
pub fn score_answers(
    answers: &BTreeMap<String, f64>,
    truths: &BTreeMap<String, TruthValue>,
    total_questions: usize,
) -> Score {
    let mut sum = 0.0;
    let mut scored = 0usize;
    for (question, probability) in answers {
        if let Some(outcome) = truths.get(question).and_then(|t| t.outcome()) {
            sum += brier(*probability, outcome);
            scored += 1;
        }
    }
    Score {
        error: (scored > 0).then(|| sum / scored as f64),
        completion: if total_questions == 0 {
            0.0
        } else {
            answers.len() as f64 / total_questions as f64
        },
        scored,
    }
}

/// Mean recorded probability per question, over the users who answered it.
pub fn consensus_values(
    questions: &[String],
    predictions: &BTreeMap<UserId, BTreeMap<String, f64>>,
) -> BTreeMap<String, f64> {
    questions
        .iter()
        .filter_map(|q| {
            let values: Vec<f64> = predictions
                .values()
                .filter_map(|answers| answers.get(q).copied())
                .collect();
            if values.is_empty() {
                None
            } else {
                Some((q.clone(), values.iter().sum::<f64>() / values.len() as f64))
            }
        })
        .collect()
}

/// Questions where the consensus landed on the wrong side of 0.5.
///
/// Exactly 0.5 is never flagged; `Unknown` truths are never flagged.
pub fn miscalibrated(
    questions: &[String],
    consensus: &BTreeMap<String, f64>,
    truths: &BTreeMap<String, TruthValue>,
) -> Vec<MiscalibrationFlag> {
    questions
        .iter()
        .filter_map(|q| {
            let value = *consensus.get(q)?;
            let truth = *truths.get(q)?;
            let wrong = match truth {
                TruthValue::True => value < 0.5,
                TruthValue::False => value > 0.5,
                TruthValue::Unknown => false,
            };
            wrong.then(|| MiscalibrationFlag {
                question: q.clone(),
                consensus: value,
                truth,
            })
        })
        .collect()
}

/// Score every participant of a group at resolution time.
pub fn score(
    questions: &[String],
    predictions: &BTreeMap<UserId, BTreeMap<String, f64>>,
    truths: &BTreeMap<String, TruthValue>,
) -> Resolution {
    let total = questions.len();

    let user_scores = predictions
        .iter()
        .map(|(user, answers)| (user.clone(), score_answers(answers, truths, total)))
        .collect();

    // The consensus forecaster "answers" every question somebody answered.
    let consensus = consensus_values(questions, predictions);
    let consensus_score = score_answers(&consensus, truths, total);
    let flags = miscalibrated(questions, &consensus, truths);

    Resolution {
        user_scores,
        consensus_score,
        consensus_values: consensus,
        flags,
    }
}
