use std::fmt;

use thiserror::Error;

/// Failures talking to the upstream responses API.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("request to LLM API failed: {0}")]
    Transport(String),

    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("failed to parse LLM API response: {0}")]
    Decode(String),
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Transport(_) => true,
            LlmError::Api { status, .. } => matches!(status, 408 | 429) || *status >= 500,
            LlmError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            LlmError::Decode(err.to_string())
        } else {
            LlmError::Transport(err.to_string())
        }
    }
}

/// Which generation step produced a [`ResearchError::Generation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Questions,
    Plan,
    Report,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Questions => "clarifying question",
            Stage::Plan => "research plan",
            Stage::Report => "report",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("{stage} generation failed: {reason}")]
    Generation { stage: Stage, reason: String },

    #[error("search for {query:?} failed: {source}")]
    Search {
        query: String,
        #[source]
        source: LlmError,
    },

    #[error("research evaluation failed: {0}")]
    Evaluation(#[source] LlmError),

    #[error("research run was cancelled")]
    Cancelled,

    #[error("session has no research plan; submit answers before running")]
    NotPlanned,
}

impl ResearchError {
    pub fn generation(stage: Stage, reason: impl fmt::Display) -> Self {
        ResearchError::Generation {
            stage,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(LlmError::Transport("connection reset".into()).is_transient());
        assert!(LlmError::Api { status: 429, body: String::new() }.is_transient());
        assert!(LlmError::Api { status: 503, body: String::new() }.is_transient());
        assert!(LlmError::Api { status: 408, body: String::new() }.is_transient());
        assert!(!LlmError::Api { status: 401, body: String::new() }.is_transient());
        assert!(!LlmError::Decode("missing field `id`".into()).is_transient());
    }

    #[test]
    fn generation_error_names_stage() {
        let err = ResearchError::generation(Stage::Plan, "empty goal");
        assert_eq!(err.to_string(), "research plan generation failed: empty goal");
    }
}
