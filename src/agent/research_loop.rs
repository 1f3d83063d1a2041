//! The iterative search/evaluate loop.
//!
//! Each round drains the backlog through the search client, then asks the
//! evaluator whether the goal is met. Rounds are capped by
//! `max_iterations`; hitting the cap ends the run as a best-effort
//! completion rather than a failure.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::evaluator::Evaluator;
use super::searcher::SearchClient;
use crate::config::ResearchSettings;
use crate::error::{LlmError, ResearchError};
use crate::instrumentation::{RoundLog, RunLog};
use crate::llm::TokenUsage;
use crate::session::{ResearchSession, SessionStatus};

const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// How the loop ended, before any report is written.
#[derive(Debug)]
pub enum LoopOutcome {
    Complete { best_effort: bool },
    Failed(ResearchError),
    Cancelled,
}

enum Attempt<T> {
    Done(T),
    Failed(LlmError),
    Cancelled,
}

pub struct ResearchLoop<'a> {
    searcher: &'a SearchClient,
    evaluator: &'a Evaluator,
    settings: &'a ResearchSettings,
}

impl<'a> ResearchLoop<'a> {
    pub fn new(
        searcher: &'a SearchClient,
        evaluator: &'a Evaluator,
        settings: &'a ResearchSettings,
    ) -> Self {
        Self {
            searcher,
            evaluator,
            settings,
        }
    }

    /// Drive `session` from its planned state to a terminal status.
    pub async fn execute(&self, session: &mut ResearchSession, log: &mut RunLog) -> LoopOutcome {
        if !session.is_planned() {
            session.status = SessionStatus::Failed;
            return LoopOutcome::Failed(ResearchError::NotPlanned);
        }
        let cancel = session.cancel_token().clone();

        loop {
            let round = session.iteration + 1;
            let mut round_log = RoundLog {
                round: round as u32,
                queries: Vec::new(),
                new_findings: 0,
                total_findings: session.findings.len() as u32,
                search_latency_ms: 0,
                evaluation_latency_ms: 0,
                retries: 0,
                usage: TokenUsage::default(),
                decision: String::new(),
            };

            if cancel.is_cancelled() {
                return self.cancelled(session, log, round_log);
            }
            session.status = SessionStatus::Searching;
            info!(round, queued = session.backlog.len(), "searching");

            let search_start = Instant::now();
            loop {
                // a cancelled run leaves unsent queries in the backlog
                if cancel.is_cancelled() {
                    round_log.search_latency_ms = elapsed_ms(search_start);
                    return self.cancelled(session, log, round_log);
                }
                let Some(query) = session.next_query() else {
                    break;
                };
                round_log.queries.push(query.clone());
                let attempt = self
                    .with_retries(&cancel, &mut round_log.retries, || self.searcher.search(&query))
                    .await;
                match attempt {
                    Attempt::Done((findings, response)) => {
                        round_log.new_findings += findings.len() as u32;
                        round_log.usage += response.usage;
                        session.record(findings);
                    }
                    Attempt::Failed(source) => {
                        round_log.search_latency_ms = elapsed_ms(search_start);
                        let cause = ResearchError::Search { query, source };
                        return self.failed(session, log, round_log, cause);
                    }
                    Attempt::Cancelled => {
                        round_log.search_latency_ms = elapsed_ms(search_start);
                        return self.cancelled(session, log, round_log);
                    }
                }
            }
            round_log.search_latency_ms = elapsed_ms(search_start);
            round_log.total_findings = session.findings.len() as u32;

            if cancel.is_cancelled() {
                return self.cancelled(session, log, round_log);
            }
            session.status = SessionStatus::Evaluating;
            info!(round, findings = session.findings.len(), "evaluating");

            let evaluation_start = Instant::now();
            let attempt = self
                .with_retries(&cancel, &mut round_log.retries, || {
                    self.evaluator.evaluate(
                        &session.goal,
                        &session.findings,
                        &session.executed,
                        session.plan_response_id.as_deref(),
                    )
                })
                .await;
            round_log.evaluation_latency_ms = elapsed_ms(evaluation_start);

            let verdict = match attempt {
                Attempt::Done((verdict, usage)) => {
                    round_log.usage += usage;
                    verdict
                }
                Attempt::Failed(source) => {
                    return self.failed(session, log, round_log, ResearchError::Evaluation(source));
                }
                Attempt::Cancelled => return self.cancelled(session, log, round_log),
            };

            session.iteration += 1;

            if verdict.is_sufficient {
                round_log.decision = "sufficient".into();
                log.rounds.push(round_log);
                session.status = SessionStatus::Complete;
                info!(rounds = session.iteration, "research goal satisfied");
                return LoopOutcome::Complete { best_effort: false };
            }

            round_log.decision = format!("insufficient({})", verdict.additional_queries.len());
            log.rounds.push(round_log);

            if session.iteration >= self.settings.max_iterations {
                session.status = SessionStatus::Complete;
                warn!(
                    rounds = session.iteration,
                    "iteration cap reached before the goal was satisfied"
                );
                return LoopOutcome::Complete { best_effort: true };
            }

            session.enqueue(verdict.additional_queries);
        }
    }

    /// Run `call` with bounded retries on transient errors. Cancellation is
    /// checked before every attempt, cuts a backoff wait short, and abandons
    /// the in-flight call, discarding its result.
    async fn with_retries<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        retries: &mut u32,
        mut call: F,
    ) -> Attempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }
            let result = tokio::select! {
                biased;
                result = call() => result,
                _ = cancel.cancelled() => return Attempt::Cancelled,
            };
            match result {
                Ok(value) => return Attempt::Done(value),
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let wait = backoff(self.settings.retry_backoff, attempt);
                    attempt += 1;
                    *retries += 1;
                    warn!(
                        attempt,
                        max_retries = self.settings.max_retries,
                        backoff_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Attempt::Cancelled,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Attempt::Failed(e),
            }
        }
    }

    fn failed(
        &self,
        session: &mut ResearchSession,
        log: &mut RunLog,
        mut round_log: RoundLog,
        cause: ResearchError,
    ) -> LoopOutcome {
        warn!(error = %cause, findings = session.findings.len(), "research run failed");
        round_log.total_findings = session.findings.len() as u32;
        round_log.decision = "failed".into();
        log.rounds.push(round_log);
        session.status = SessionStatus::Failed;
        LoopOutcome::Failed(cause)
    }

    fn cancelled(
        &self,
        session: &mut ResearchSession,
        log: &mut RunLog,
        mut round_log: RoundLog,
    ) -> LoopOutcome {
        info!(findings = session.findings.len(), "research run cancelled");
        round_log.total_findings = session.findings.len() as u32;
        round_log.decision = "cancelled".into();
        log.rounds.push(round_log);
        session.status = SessionStatus::Cancelled;
        LoopOutcome::Cancelled
    }
}

fn backoff(base: Duration, attempt: usize) -> Duration {
    let factor = 1u32 << attempt.min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CallKind, LlmBackend, MockBackend};
    use crate::session::ResearchPlan;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    const GOAL: &str = "Assess grid-scale storage options";

    fn settings(max_iterations: usize) -> ResearchSettings {
        ResearchSettings {
            max_iterations,
            retry_backoff: Duration::ZERO,
            ..Default::default()
        }
    }

    fn planned(queries: &[&str]) -> ResearchSession {
        let mut session = ResearchSession::new("energy storage");
        session.status = SessionStatus::Planning;
        session.apply_plan(&ResearchPlan {
            goal: GOAL.into(),
            queries: queries.iter().map(|q| q.to_string()).collect(),
        });
        session
    }

    fn one_source(n: usize) -> Result<crate::llm::LlmResponse, LlmError> {
        let url = format!("https://source.example/{}", n);
        Ok(MockBackend::cited_response(&[("A fact.", url.as_str())]))
    }

    async fn run(
        mock: &Arc<MockBackend>,
        settings: &ResearchSettings,
        session: &mut ResearchSession,
    ) -> (LoopOutcome, RunLog) {
        let backend: Arc<dyn LlmBackend> = mock.clone();
        let searcher = SearchClient::new(backend.clone(), "big".into());
        let evaluator = Evaluator::new(backend, "big".into(), 2);
        let mut log = RunLog::new(session.id.to_string(), &session.topic, &session.goal);
        let outcome = ResearchLoop::new(&searcher, &evaluator, settings)
            .execute(session, &mut log)
            .await;
        (outcome, log)
    }

    #[tokio::test]
    async fn iteration_cap_ends_in_best_effort_completion() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fallback(CallKind::Search, one_source(0));
        mock.set_fallback(
            CallKind::Evaluate,
            Ok(MockBackend::text_response("{\"sufficient\": false, \"queries\": []}")),
        );
        mock.set_fallback(CallKind::FollowUp, Ok(MockBackend::text_response("[]")));
        let mut session = planned(&["q1"]);

        let (outcome, log) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Complete { best_effort: true }));
        assert_eq!(mock.calls(CallKind::Evaluate), 3);
        assert_eq!(session.iteration, 3);
        assert_eq!(session.status, SessionStatus::Complete);
        assert_eq!(log.rounds.len(), 3);
        // each round searched exactly one new query
        assert_eq!(mock.calls(CallKind::Search), 3);
        assert_eq!(session.executed.len(), 3);
    }

    #[tokio::test]
    async fn findings_never_shrink_across_rounds() {
        let mock = Arc::new(MockBackend::new());
        for n in 0..4 {
            mock.queue(CallKind::Search, one_source(n));
        }
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": false, \"queries\": [\"q2\", \"q3\"]}");
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": false, \"queries\": [\"q4\"]}");
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": true}");
        let mut session = planned(&["q1"]);

        let (outcome, log) = run(&mock, &settings(5), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Complete { best_effort: false }));
        let totals: Vec<u32> = log.rounds.iter().map(|r| r.total_findings).collect();
        assert_eq!(totals, vec![1, 3, 4]);
        assert_eq!(session.findings.len(), 4);
        assert_eq!(session.executed, vec!["q1", "q2", "q3", "q4"]);
    }

    #[tokio::test]
    async fn transient_search_errors_are_retried() {
        let mock = Arc::new(MockBackend::new());
        mock.queue(CallKind::Search, Err(LlmError::Api { status: 503, body: String::new() }));
        mock.queue(CallKind::Search, Err(LlmError::Transport("reset".into())));
        mock.queue(CallKind::Search, one_source(1));
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": true}");
        let mut session = planned(&["q1"]);

        let (outcome, log) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Complete { best_effort: false }));
        assert_eq!(mock.calls(CallKind::Search), 3);
        assert_eq!(log.rounds[0].retries, 2);
        assert_eq!(session.findings.len(), 1);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_without_retry() {
        let mock = Arc::new(MockBackend::new());
        mock.queue(CallKind::Search, one_source(1));
        mock.queue(CallKind::Evaluate, Err(LlmError::Api { status: 401, body: "bad key".into() }));
        let mut session = planned(&["q1"]);

        let (outcome, _) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Failed(ResearchError::Evaluation(_))));
        assert_eq!(mock.calls(CallKind::Evaluate), 1);
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.findings.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_search_retries_fail_with_partial_findings() {
        let mock = Arc::new(MockBackend::new());
        mock.queue(CallKind::Search, one_source(1));
        mock.set_fallback(CallKind::Search, Err(LlmError::Transport("timed out".into())));
        let mut session = planned(&["q1", "q2", "q3"]);

        let (outcome, log) = run(&mock, &settings(3), &mut session).await;

        match outcome {
            LoopOutcome::Failed(ResearchError::Search { query, .. }) => assert_eq!(query, "q2"),
            other => panic!("expected search failure, got {:?}", other),
        }
        // one success plus the initial attempt and two retries for q2
        assert_eq!(mock.calls(CallKind::Search), 4);
        assert_eq!(session.findings.len(), 1);
        assert_eq!(session.backlog, vec!["q3"]);
        assert_eq!(log.rounds[0].decision, "failed");
    }

    #[tokio::test]
    async fn cancellation_before_evaluation_keeps_searched_findings() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fallback(CallKind::Search, one_source(7));
        let mut session = planned(&["q1", "q2"]);
        mock.cancel_on_call(CallKind::Search, 2, session.cancel_handle());

        let (outcome, _) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.findings.len(), 2);
        assert_eq!(mock.calls(CallKind::Evaluate), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_remaining_searches_in_the_round() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fallback(CallKind::Search, one_source(1));
        let mut session = planned(&["q1", "q2", "q3"]);
        mock.cancel_on_call(CallKind::Search, 1, session.cancel_handle());

        let (outcome, log) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert_eq!(mock.calls(CallKind::Search), 1);
        assert_eq!(session.executed, vec!["q1"]);
        assert_eq!(session.backlog, vec!["q2", "q3"]);
        assert_eq!(session.findings.len(), 1);
        assert_eq!(log.rounds[0].decision, "cancelled");
    }

    #[tokio::test]
    async fn cancellation_during_backoff_skips_the_retry() {
        let mock = Arc::new(MockBackend::new());
        mock.queue(CallKind::Search, Err(LlmError::Api { status: 429, body: String::new() }));
        mock.set_fallback(CallKind::Search, one_source(1));
        let settings = ResearchSettings {
            retry_backoff: Duration::from_secs(30),
            ..settings(3)
        };
        let mut session = planned(&["q1"]);
        let handle = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let (outcome, log) = run(&mock, &settings, &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(mock.calls(CallKind::Search), 1);
        assert_eq!(log.rounds[0].retries, 1);
        assert!(session.findings.is_empty());
    }

    #[tokio::test]
    async fn cancellation_abandons_a_pending_call() {
        let mock = Arc::new(MockBackend::new());
        mock.set_fallback(CallKind::Search, one_source(1));
        mock.delay(CallKind::Search, Duration::from_secs(30));
        let mut session = planned(&["q1", "q2"]);
        let handle = session.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let (outcome, _) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(mock.calls(CallKind::Search), 1);
        assert!(session.findings.is_empty());
        assert_eq!(session.backlog, vec!["q2"]);
        assert_eq!(mock.calls(CallKind::Evaluate), 0);
    }

    #[tokio::test]
    async fn unplanned_session_is_rejected() {
        let mock = Arc::new(MockBackend::new());
        let mut session = ResearchSession::new("energy storage");

        let (outcome, _) = run(&mock, &settings(3), &mut session).await;

        assert!(matches!(outcome, LoopOutcome::Failed(ResearchError::NotPlanned)));
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 0), Duration::from_millis(500));
        assert_eq!(backoff(base, 2), Duration::from_secs(2));
        assert_eq!(backoff(base, 10), MAX_BACKOFF);
    }
}
