//! Guided deep-research assistant: clarifying questions, a search plan, an
//! iterative web-search loop judged against a research goal, and a cited
//! report.

pub mod agent;
pub mod config;
pub mod error;
pub mod instrumentation;
pub mod llm;
pub mod session;

pub use agent::ResearchAssistant;
pub use config::{Config, ResearchSettings};
pub use error::{LlmError, ResearchError, Stage};
pub use session::{
    CancelHandle, Citation, EvaluationVerdict, Finding, Report, ResearchPlan, ResearchSession,
    RunOutcome, RunResult, SessionStatus,
};
