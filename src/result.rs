use serde::{Deserialize, Serialize};

/// Outcome of one INPUT phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputResult {
    None,
    Complete,
    Error,
    FormNotFound,
    FieldExtractionFailed,
    MappingError,
    FillFormError,
    SubmitControlNotFound,
    SubmitClickFailed,
    InvalidInputFormat,
    ChallengeDetected,
    NotSubmittedForDebug,
    SessionFailed,
}

impl InputResult {
    /// Codes that send the classifier straight to ERROR.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::None | Self::Complete)
    }

    /// Codes for which another INPUT attempt cannot change the outcome.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::FormNotFound | Self::ChallengeDetected | Self::NotSubmittedForDebug
        )
    }
}

/// Outcome of the CONFIRM phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmResult {
    None,
    Success,
    Error,
    ConfirmButtonNotFound,
    NotSubmittedForDebug,
}

impl ConfirmResult {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::ConfirmButtonNotFound)
    }
}

/// Session-level verdict written to the audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Success,
    Error,
}

/// Short marker written back into the target row.
pub fn result_marker(input: InputResult, verdict: Verdict) -> &'static str {
    match input {
        InputResult::Complete => match verdict {
            Verdict::Success => "○",
            Verdict::Error => "△",
        },
        InputResult::Error | InputResult::SessionFailed => "×",
        InputResult::FormNotFound | InputResult::NotSubmittedForDebug => "-",
        _ => "?",
    }
}
