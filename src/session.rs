//! State owned by one research run, and the values it produces.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ResearchError;
use crate::instrumentation::RunLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Questions asked, waiting for the user's answers.
    Collecting,
    /// Plan in progress, or planned and ready to run.
    Planning,
    Searching,
    Evaluating,
    Complete,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub query: String,
    pub snippet: String,
    pub citation: Option<Citation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationVerdict {
    pub is_sufficient: bool,
    pub additional_queries: Vec<String>,
}

impl EvaluationVerdict {
    pub fn sufficient() -> Self {
        Self {
            is_sufficient: true,
            additional_queries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchPlan {
    pub goal: String,
    pub queries: Vec<String>,
}

/// Final narrative. Marker `[n]` in `text` refers to `citations[n - 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub text: String,
    pub citations: Vec<Citation>,
}

impl Report {
    pub fn to_markdown(&self) -> String {
        let mut out = self.text.trim_end().to_string();
        if !self.citations.is_empty() {
            out.push_str("\n\n## References\n\n");
            for (i, citation) in self.citations.iter().enumerate() {
                match &citation.title {
                    Some(title) => {
                        out.push_str(&format!("[{}] {} - {}\n", i + 1, title, citation.url))
                    }
                    None => out.push_str(&format!("[{}] {}\n", i + 1, citation.url)),
                }
            }
        }
        out
    }
}

/// Cancels a session's run from outside the task driving it.
#[derive(Debug, Clone)]
pub struct CancelHandle(CancellationToken);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

#[derive(Debug)]
pub struct ResearchSession {
    pub id: Uuid,
    pub topic: String,
    pub questions: Vec<String>,
    pub answers: Vec<String>,
    pub goal: String,
    pub backlog: VecDeque<String>,
    pub executed: Vec<String>,
    pub findings: Vec<Finding>,
    pub iteration: usize,
    pub status: SessionStatus,
    pub(crate) questions_response_id: Option<String>,
    pub(crate) plan_response_id: Option<String>,
    cancel: CancellationToken,
}

impl ResearchSession {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            questions: Vec::new(),
            answers: Vec::new(),
            goal: String::new(),
            backlog: VecDeque::new(),
            executed: Vec::new(),
            findings: Vec::new(),
            iteration: 0,
            status: SessionStatus::Collecting,
            questions_response_id: None,
            plan_response_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_planned(&self) -> bool {
        self.status == SessionStatus::Planning && !self.goal.is_empty()
    }

    /// Replace the plan and seed the backlog with its queries.
    pub(crate) fn apply_plan(&mut self, plan: &ResearchPlan) {
        self.goal = plan.goal.clone();
        self.backlog = plan.queries.iter().cloned().collect();
    }

    /// Queue queries for the next round, skipping any already pending.
    pub(crate) fn enqueue(&mut self, queries: impl IntoIterator<Item = String>) {
        for query in queries {
            if !self.backlog.contains(&query) {
                self.backlog.push_back(query);
            }
        }
    }

    pub(crate) fn next_query(&mut self) -> Option<String> {
        let query = self.backlog.pop_front()?;
        self.executed.push(query.clone());
        Some(query)
    }

    pub(crate) fn record(&mut self, findings: Vec<Finding>) {
        self.findings.extend(findings);
    }
}

#[derive(Debug)]
pub enum RunResult {
    Completed { report: Report, best_effort: bool },
    Failed(ResearchError),
    Cancelled,
}

/// Everything a finished run hands back. `findings` is populated on every
/// path, so failed and cancelled runs still expose partial results.
#[derive(Debug)]
pub struct RunOutcome {
    pub goal: String,
    pub findings: Vec<Finding>,
    pub result: RunResult,
    pub log: RunLog,
}

impl RunOutcome {
    pub fn report(&self) -> Option<&Report> {
        match &self.result {
            RunResult::Completed { report, .. } => Some(report),
            _ => None,
        }
    }

    /// A failed or cancelled run that still collected something.
    pub fn has_partial_result(&self) -> bool {
        !matches!(self.result, RunResult::Completed { .. }) && !self.findings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backlog_is_consumed_once_in_order() {
        let mut session = ResearchSession::new("tides");
        session.apply_plan(&ResearchPlan {
            goal: "understand tidal power".into(),
            queries: vec!["a".into(), "b".into()],
        });
        session.enqueue(vec!["b".to_string(), "c".to_string()]);

        let mut seen = Vec::new();
        while let Some(q) = session.next_query() {
            seen.push(q);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(session.executed, vec!["a", "b", "c"]);
        assert!(session.backlog.is_empty());
    }

    #[test]
    fn cancel_handle_shares_token() {
        let session = ResearchSession::new("tides");
        let handle = session.cancel_handle();
        assert!(!session.is_cancelled());
        handle.cancel();
        assert!(session.is_cancelled());
    }

    #[test]
    fn markdown_appends_reference_list() {
        let report = Report {
            text: "Pumped hydro leads [1]; batteries follow [2].\n".into(),
            citations: vec![
                Citation {
                    url: "https://a.example".into(),
                    title: Some("Hydro".into()),
                },
                Citation {
                    url: "https://b.example".into(),
                    title: None,
                },
            ],
        };
        assert_eq!(
            report.to_markdown(),
            "Pumped hydro leads [1]; batteries follow [2].\n\n## References\n\n\
             [1] Hydro - https://a.example\n[2] https://b.example\n"
        );
    }
}
