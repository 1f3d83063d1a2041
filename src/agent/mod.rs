pub mod evaluator;
pub mod planner;
pub mod questions;
pub mod research_loop;
pub mod searcher;
pub mod synthesizer;

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument};

use crate::config::ResearchSettings;
use crate::error::ResearchError;
use crate::instrumentation::RunLog;
use crate::llm::LlmBackend;
use crate::session::{
    CancelHandle, Finding, Report, ResearchPlan, ResearchSession, RunOutcome, RunResult,
    SessionStatus,
};

use evaluator::Evaluator;
use planner::Planner;
use questions::QuestionGenerator;
use research_loop::{LoopOutcome, ResearchLoop};
use searcher::SearchClient;
use synthesizer::Synthesizer;

pub(crate) const RESEARCHER_INSTRUCTIONS: &str = "You are an expert deep researcher. \
You provide complete, in-depth and well-sourced research to the user.";

/// Caller-facing entry point: one instance serves any number of sessions,
/// each of which owns all of its own state.
pub struct ResearchAssistant {
    questions: QuestionGenerator,
    planner: Planner,
    searcher: SearchClient,
    evaluator: Evaluator,
    synthesizer: Synthesizer,
    settings: ResearchSettings,
}

impl ResearchAssistant {
    pub fn new(llm: Arc<dyn LlmBackend>, settings: ResearchSettings) -> Self {
        let model = settings.research_model.clone();
        Self {
            questions: QuestionGenerator::new(
                llm.clone(),
                settings.question_model.clone(),
                settings.question_count,
            ),
            planner: Planner::new(llm.clone(), model.clone(), settings.initial_query_count),
            searcher: SearchClient::new(llm.clone(), model.clone()),
            evaluator: Evaluator::new(llm.clone(), model.clone(), settings.max_follow_up_queries),
            synthesizer: Synthesizer::new(llm, model),
            settings,
        }
    }

    pub fn settings(&self) -> &ResearchSettings {
        &self.settings
    }

    /// Open a session for `topic`. Its `questions` are to be answered and
    /// passed to [`ResearchAssistant::submit_answers`].
    pub async fn start(&self, topic: &str) -> Result<ResearchSession, ResearchError> {
        let (questions, response) = self.questions.generate(topic).await?;
        let mut session = ResearchSession::new(topic.trim());
        session.questions = questions;
        session.questions_response_id = Some(response.id);
        info!(session = %session.id, questions = session.questions.len(), "session started");
        Ok(session)
    }

    #[instrument(skip_all, fields(session = %session.id))]
    pub async fn submit_answers(
        &self,
        session: &mut ResearchSession,
        answers: Vec<String>,
    ) -> Result<ResearchPlan, ResearchError> {
        session.status = SessionStatus::Planning;
        let planned = self
            .planner
            .plan(
                &session.topic,
                &session.questions,
                &answers,
                session.questions_response_id.as_deref(),
            )
            .await;
        let (plan, response) = match planned {
            Ok(planned) => planned,
            Err(e) => {
                session.status = SessionStatus::Collecting;
                return Err(e);
            }
        };

        session.answers = answers;
        session.plan_response_id = Some(response.id);
        session.apply_plan(&plan);
        info!(goal = %plan.goal, queries = plan.queries.len(), "research planned");
        Ok(plan)
    }

    /// Run the research loop and write the report. Takes the session by
    /// value; whatever it collected comes back in the outcome.
    #[instrument(skip_all, fields(session = %session.id))]
    pub async fn run(&self, mut session: ResearchSession) -> RunOutcome {
        let run_start = Instant::now();
        let mut log = RunLog::new(session.id.to_string(), &session.topic, &session.goal);

        let research = ResearchLoop::new(&self.searcher, &self.evaluator, &self.settings);
        let result = match research.execute(&mut session, &mut log).await {
            LoopOutcome::Complete { best_effort } => {
                let report_start = Instant::now();
                let synthesized = self.synthesizer.synthesize(&session.goal, &session.findings).await;
                log.report_latency_ms = report_start.elapsed().as_millis() as u64;
                match synthesized {
                    Ok((report, response)) => {
                        log.report_usage = response.usage;
                        log.citations = report.citations.len() as u32;
                        RunResult::Completed {
                            report,
                            best_effort,
                        }
                    }
                    Err(e) => {
                        session.status = SessionStatus::Failed;
                        RunResult::Failed(e)
                    }
                }
            }
            LoopOutcome::Failed(e) => RunResult::Failed(e),
            LoopOutcome::Cancelled => RunResult::Cancelled,
        };

        log.status = session.status;
        log.best_effort = matches!(
            result,
            RunResult::Completed {
                best_effort: true,
                ..
            }
        );
        if let RunResult::Failed(e) = &result {
            log.error = Some(e.to_string());
        }
        log.total_latency_ms = run_start.elapsed().as_millis() as u64;
        info!(status = ?session.status, "{}", log.summary());

        RunOutcome {
            goal: session.goal,
            findings: session.findings,
            result,
            log,
        }
    }

    /// Request cancellation of the run owning `handle`. The loop stops at
    /// its next step boundary.
    pub fn cancel(&self, handle: &CancelHandle) {
        handle.cancel();
    }

    /// Write a report from findings gathered elsewhere, such as the partial
    /// findings of a failed or cancelled run.
    pub async fn report(&self, goal: &str, findings: &[Finding]) -> Result<Report, ResearchError> {
        let (report, _) = self.synthesizer.synthesize(goal, findings).await?;
        Ok(report)
    }
}

/// Slice out the outermost `open`..`close` span, for responses that wrap
/// JSON in prose or code fences.
pub(crate) fn extract_json(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start < end).then(|| &text[start..=end])
}

/// Remove a leading `1.`, `2)`, `-` or `*` list marker.
pub(crate) fn strip_list_marker(line: &str) -> &str {
    let line = line.trim();
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    let rest = if rest.len() < line.len() {
        rest.strip_prefix(['.', ')', ':']).unwrap_or(line)
    } else {
        rest.strip_prefix(['-', '*', '•']).unwrap_or(rest)
    };
    rest.trim()
}

/// Trim and de-list queries, dropping blanks, duplicates and anything in
/// `exclude`, all case-insensitively.
pub(crate) fn clean_queries(queries: Vec<String>, exclude: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for query in queries {
        let query = strip_list_marker(&query).trim_matches('"').trim();
        if query.is_empty() {
            continue;
        }
        let seen = |q: &String| q.eq_ignore_ascii_case(query);
        if cleaned.iter().any(seen) || exclude.iter().any(seen) {
            continue;
        }
        cleaned.push(query.to_string());
    }
    cleaned
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        s
    } else {
        let mut end = max_bytes;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}
