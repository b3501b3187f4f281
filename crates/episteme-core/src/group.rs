// Prediction groups: questions, per-user predictions, and resolved truths.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};
use crate::scoring::{self, Resolution};

/// Opaque identifier of a chat user, as delivered by the messaging gateway.
pub type UserId = String;

// ---------------------------------------------------------------------------
// Truth values
// ---------------------------------------------------------------------------

/// The resolved outcome of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruthValue {
    True,
    False,
    /// The outcome could not be determined. Excluded from scoring.
    Unknown,
}

impl TruthValue {
    /// The binary outcome this truth is scored against, or `None` for
    /// `Unknown`.
    pub fn outcome(self) -> Option<f64> {
        match self {
            TruthValue::True => Some(1.0),
            TruthValue::False => Some(0.0),
            TruthValue::Unknown => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TruthValue::True => "true",
            TruthValue::False => "false",
            TruthValue::Unknown => "unknown",
        }
    }
}

impl FromStr for TruthValue {
    type Err = ForecastError;

    /// Accepts exactly `true`, `false` or `unknown` (surrounding whitespace
    /// ignored, tokens are case-sensitive).
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "true" => Ok(TruthValue::True),
            "false" => Ok(TruthValue::False),
            "unknown" => Ok(TruthValue::Unknown),
            other => Err(ForecastError::InvalidTruthValue(other.to_string())),
        }
    }
}

impl fmt::Display for TruthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PredictionGroup
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Open,
    Resolved,
}

/// A named set of forecasting questions, every user's recorded
/// probabilities, and (once resolved) the true outcomes.
///
/// Invariants maintained by the mutating methods:
/// - `questions` holds no duplicates and keeps insertion order.
/// - a prediction exists only for a question in `questions`.
/// - `truths` is empty while open and covers every question once resolved.
/// - nothing changes after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionGroup {
    name: String,
    status: GroupStatus,
    questions: Vec<String>,
    predictions: BTreeMap<UserId, BTreeMap<String, f64>>,
    truths: BTreeMap<String, TruthValue>,
}

impl PredictionGroup {
    /// Create a new, empty, open group.
    pub fn new(name: impl Into<String>) -> Self {
        PredictionGroup {
            name: name.into(),
            status: GroupStatus::Open,
            questions: Vec::new(),
            predictions: BTreeMap::new(),
            truths: BTreeMap::new(),
        }
    }

    /// Check that `name` can name a group.
    ///
    /// Group names double as file stems for exported scoreboards, so they
    /// must be non-empty, must not start with `.`, and must not contain path
    /// separators or control characters.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.chars().any(|c| c == '/' || c == '\\' || c.is_control());
        if valid {
            Ok(())
        } else {
            Err(ForecastError::InvalidGroupName(name.to_string()))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn is_resolved(&self) -> bool {
        self.status == GroupStatus::Resolved
    }

    /// Questions in insertion order.
    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    pub fn has_question(&self, question: &str) -> bool {
        self.questions.iter().any(|q| q == question)
    }

    pub fn predictions(&self) -> &BTreeMap<UserId, BTreeMap<String, f64>> {
        &self.predictions
    }

    pub fn truths(&self) -> &BTreeMap<String, TruthValue> {
        &self.truths
    }

    /// Users with at least one recorded prediction.
    pub fn participants(&self) -> impl Iterator<Item = &UserId> {
        self.predictions.keys()
    }

    /// Append a question. Existing predictions are untouched.
    pub fn add_question(&mut self, text: &str) -> Result<()> {
        if self.is_resolved() {
            return Err(ForecastError::AlreadyResolved(self.name.clone()));
        }
        if self.has_question(text) {
            return Err(ForecastError::DuplicateQuestion(text.to_string()));
        }
        self.questions.push(text.to_string());
        Ok(())
    }

    /// Insert or overwrite `user`'s probability for `question`.
    ///
    /// The probability is expected to be validated into `[0, 1]` by the
    /// caller; this is a pure data mutation.
    pub fn set_prediction(&mut self, user: &str, question: &str, probability: f64) -> Result<()> {
        if !self.has_question(question) {
            return Err(ForecastError::UnknownQuestion(question.to_string()));
        }
        if self.is_resolved() {
            return Err(ForecastError::AlreadyResolved(self.name.clone()));
        }
        self.predictions
            .entry(user.to_string())
            .or_default()
            .insert(question.to_string(), probability);
        Ok(())
    }

    /// First question (in insertion order) that `user` has not answered yet.
    pub fn next_unanswered_question(&self, user: &str) -> Option<&str> {
        let answered = self.predictions.get(user);
        self.questions
            .iter()
            .find(|q| answered.map_or(true, |a| !a.contains_key(q.as_str())))
            .map(String::as_str)
    }

    /// First question (in insertion order) without an entry in `drafted`.
    pub fn next_undrafted_question(&self, drafted: &BTreeMap<String, TruthValue>) -> Option<&str> {
        self.questions
            .iter()
            .find(|q| !drafted.contains_key(q.as_str()))
            .map(String::as_str)
    }

    /// Every question paired with `user`'s recorded probability, or `None`
    /// when unanswered, in question order.
    pub fn predictions_for(&self, user: &str) -> Vec<(&str, Option<f64>)> {
        let answered = self.predictions.get(user);
        self.questions
            .iter()
            .map(|q| (q.as_str(), answered.and_then(|a| a.get(q).copied())))
            .collect()
    }

    /// Number of questions `user` has answered.
    pub fn answered_count(&self, user: &str) -> usize {
        self.predictions.get(user).map_or(0, BTreeMap::len)
    }

    /// Record the true outcomes, close the group, and score everyone.
    ///
    /// `truths` must cover exactly the group's questions. Leaves the group
    /// untouched on error.
    pub fn resolve(&mut self, truths: BTreeMap<String, TruthValue>) -> Result<Resolution> {
        if self.is_resolved() {
            return Err(ForecastError::AlreadyResolved(self.name.clone()));
        }
        if self.questions.is_empty() {
            return Err(ForecastError::EmptyGroup(self.name.clone()));
        }

        let missing: Vec<String> = self
            .questions
            .iter()
            .filter(|q| !truths.contains_key(q.as_str()))
            .cloned()
            .collect();
        let unexpected: Vec<String> = truths
            .keys()
            .filter(|q| !self.has_question(q))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ForecastError::TruthsMismatch {
                group: self.name.clone(),
                missing,
                unexpected,
            });
        }

        let resolution = scoring::score(&self.questions, &self.predictions, &truths);
        self.truths = truths;
        self.status = GroupStatus::Resolved;
        Ok(resolution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_with(questions: &[&str]) -> PredictionGroup {
        let mut group = PredictionGroup::new("G");
        for q in questions {
            group.add_question(q).unwrap();
        }
        group
    }

    fn truths(entries: &[(&str, TruthValue)]) -> BTreeMap<String, TruthValue> {
        entries.iter().map(|(q, t)| (q.to_string(), *t)).collect()
    }

    #[test]
    fn new_group_is_open_and_empty() {
        let group = PredictionGroup::new("G");
        assert_eq!(group.status(), GroupStatus::Open);
        assert!(group.questions().is_empty());
        assert!(group.predictions().is_empty());
        assert!(group.truths().is_empty());
    }

    #[test]
    fn add_question_rejects_duplicates() {
        let mut group = group_with(&["Q1"]);
        let err = group.add_question("Q1").unwrap_err();
        assert!(matches!(err, ForecastError::DuplicateQuestion(q) if q == "Q1"));
        assert_eq!(group.questions(), &["Q1".to_string()]);
    }

    #[test]
    fn questions_are_case_sensitive() {
        let group = group_with(&["Rain tomorrow?", "rain tomorrow?"]);
        assert_eq!(group.questions().len(), 2);
    }

    #[test]
    fn add_question_keeps_existing_predictions() {
        let mut group = group_with(&["Q1"]);
        group.set_prediction("alice", "Q1", 0.4).unwrap();
        group.add_question("Q2").unwrap();
        assert_eq!(group.predictions_for("alice"), vec![("Q1", Some(0.4)), ("Q2", None)]);
    }

    #[test]
    fn set_prediction_unknown_question_leaves_predictions_unchanged() {
        let mut group = group_with(&["Q1"]);
        let err = group.set_prediction("alice", "Q9", 0.5).unwrap_err();
        assert!(matches!(err, ForecastError::UnknownQuestion(_)));
        assert!(group.predictions().is_empty());
    }

    #[test]
    fn set_prediction_overwrites() {
        let mut group = group_with(&["Q1"]);
        group.set_prediction("alice", "Q1", 0.4).unwrap();
        group.set_prediction("alice", "Q1", 0.9).unwrap();
        assert_eq!(group.predictions()["alice"]["Q1"], 0.9);
        assert_eq!(group.answered_count("alice"), 1);
    }

    #[test]
    fn set_prediction_after_resolution_is_rejected() {
        let mut group = group_with(&["Q1"]);
        group.set_prediction("alice", "Q1", 0.4).unwrap();
        group.resolve(truths(&[("Q1", TruthValue::True)])).unwrap();

        let before = group.clone();
        let err = group.set_prediction("alice", "Q1", 0.1).unwrap_err();
        assert!(matches!(err, ForecastError::AlreadyResolved(_)));
        assert_eq!(group, before);
    }

    #[test]
    fn next_unanswered_follows_insertion_order() {
        let mut group = group_with(&["Q1", "Q2", "Q3"]);
        assert_eq!(group.next_unanswered_question("alice"), Some("Q1"));

        group.set_prediction("alice", "Q2", 0.5).unwrap();
        assert_eq!(group.next_unanswered_question("alice"), Some("Q1"));

        group.set_prediction("alice", "Q1", 0.5).unwrap();
        assert_eq!(group.next_unanswered_question("alice"), Some("Q3"));

        group.set_prediction("alice", "Q3", 0.5).unwrap();
        assert_eq!(group.next_unanswered_question("alice"), None);
        // Other users are unaffected.
        assert_eq!(group.next_unanswered_question("bob"), Some("Q1"));
    }

    #[test]
    fn next_unanswered_on_empty_group_is_none() {
        let group = PredictionGroup::new("G");
        assert_eq!(group.next_unanswered_question("alice"), None);
    }

    #[test]
    fn next_undrafted_question_skips_drafted() {
        let group = group_with(&["Q1", "Q2"]);
        let drafted = truths(&[("Q1", TruthValue::Unknown)]);
        assert_eq!(group.next_undrafted_question(&drafted), Some("Q2"));
    }

    #[test]
    fn resolve_requires_exact_truth_coverage() {
        let mut group = group_with(&["Q1", "Q2"]);
        let err = group
            .resolve(truths(&[("Q1", TruthValue::True), ("Q3", TruthValue::False)]))
            .unwrap_err();
        match err {
            ForecastError::TruthsMismatch { missing, unexpected, .. } => {
                assert_eq!(missing, vec!["Q2".to_string()]);
                assert_eq!(unexpected, vec!["Q3".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(group.status(), GroupStatus::Open);
        assert!(group.truths().is_empty());
    }

    #[test]
    fn resolve_empty_group_is_rejected() {
        let mut group = PredictionGroup::new("G");
        assert!(matches!(
            group.resolve(BTreeMap::new()),
            Err(ForecastError::EmptyGroup(_))
        ));
    }

    #[test]
    fn resolve_twice_is_rejected() {
        let mut group = group_with(&["Q1"]);
        group.resolve(truths(&[("Q1", TruthValue::False)])).unwrap();
        assert!(group.is_resolved());
        assert!(matches!(
            group.resolve(truths(&[("Q1", TruthValue::True)])),
            Err(ForecastError::AlreadyResolved(_))
        ));
        assert_eq!(group.truths()["Q1"], TruthValue::False);
    }

    #[test]
    fn truth_value_parsing() {
        assert_eq!("true".parse::<TruthValue>().unwrap(), TruthValue::True);
        assert_eq!(" false ".parse::<TruthValue>().unwrap(), TruthValue::False);
        assert_eq!("unknown".parse::<TruthValue>().unwrap(), TruthValue::Unknown);
        assert!(matches!(
            "True".parse::<TruthValue>(),
            Err(ForecastError::InvalidTruthValue(_))
        ));
    }

    #[test]
    fn serde_round_trip_preserves_group() {
        let mut group = group_with(&["Q1", "Q2"]);
        group.set_prediction("alice", "Q2", 0.25).unwrap();
        let json = serde_json::to_string(&group).unwrap();
        let restored: PredictionGroup = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, group);
        assert!(json.contains("\"status\":\"open\""));
    }

    #[test]
    fn group_names_must_be_safe_file_stems() {
        for ok in ["weather", "q3-2026", "Élections_2027", "a.b"] {
            assert!(PredictionGroup::validate_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "./../../escape", "../x", ".hidden", "a/b", "a\\b", "tab\there"] {
            assert!(
                matches!(
                    PredictionGroup::validate_name(bad),
                    Err(ForecastError::InvalidGroupName(name)) if name == bad
                ),
                "{bad:?}"
            );
        }
    }
}
