// Error taxonomy for prediction group operations.

use thiserror::Error;

/// Everything that can go wrong while driving a prediction group.
///
/// All variants except [`ForecastError::Storage`] are user-input errors: they
/// are reported back on the originating channel, the session stays where it
/// was, and the same step is retried. `Storage` aborts the enclosing command.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("there is no open prediction group named `{0}`")]
    UnknownGroup(String),

    #[error("`{0}` is not a question in this group")]
    UnknownQuestion(String),

    #[error("the question `{0}` already exists in this group")]
    DuplicateQuestion(String),

    #[error("the prediction group `{0}` has already been resolved")]
    AlreadyResolved(String),

    #[error("`{0}` is not a number; answer with a percentage between 0 and 100")]
    InvalidNumberFormat(String),

    #[error("{0} is out of range; answer with a percentage between 0 and 100")]
    OutOfRangeProbability(f64),

    #[error("`{0}` is not a truth value; answer with true, false or unknown")]
    InvalidTruthValue(String),

    #[error("a prediction group named `{0}` already exists")]
    GroupExists(String),

    #[error("{0:?} cannot be a group name; avoid `/`, `\\`, a leading `.` and control characters")]
    InvalidGroupName(String),

    #[error("you are already {0}; finish or cancel that first")]
    SessionInProgress(String),

    #[error("you have already answered every question in `{0}`")]
    NoUnansweredQuestions(String),

    #[error("the prediction group `{0}` has no questions")]
    EmptyGroup(String),

    #[error("truth values do not match the questions of `{group}` (missing: {missing:?}, unexpected: {unexpected:?})")]
    TruthsMismatch {
        group: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl ForecastError {
    /// Whether this error was caused by the user's input (as opposed to the
    /// persistence layer failing underneath us).
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            ForecastError::Storage(_) | ForecastError::TruthsMismatch { .. }
        )
    }
}

pub type Result<T, E = ForecastError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_are_not_user_errors() {
        let err = ForecastError::from(anyhow::anyhow!("disk full"));
        assert!(!err.is_user_error());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn input_errors_are_user_errors() {
        assert!(ForecastError::UnknownGroup("g".into()).is_user_error());
        assert!(ForecastError::OutOfRangeProbability(140.0).is_user_error());
        assert!(ForecastError::InvalidTruthValue("maybe".into()).is_user_error());
        assert!(ForecastError::InvalidGroupName("../x".into()).is_user_error());
    }
}
