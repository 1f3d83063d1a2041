use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{clean_queries, extract_json, truncate, RESEARCHER_INSTRUCTIONS};
use crate::error::LlmError;
use crate::llm::{CallKind, InputMessage, LlmBackend, LlmRequest, Role, TokenUsage};
use crate::session::{EvaluationVerdict, Finding};

const EVALUATION_PROMPT: &str = r#"Decide whether the research data above fully satisfies the research goal.

1. If it does, respond with:
   {"sufficient": true}

2. If it does not, respond with:
   {"sufficient": false, "queries": ["query 1", "query 2"]}
   Provide web search queries targeting the specific gaps that remain.

Respond with ONLY the JSON object. No other text."#;

/// Longest snippet passed to the evaluator, in bytes.
const SNIPPET_LIMIT: usize = 600;

/// Suffixes tried, in order, when deriving a last-resort query from the goal.
const FALLBACK_ANGLES: &[&str] = &[
    "",
    " latest data and statistics",
    " expert analysis",
    " case studies",
    " challenges and limitations",
];

#[derive(Deserialize)]
struct EvaluationOutput {
    sufficient: bool,
    #[serde(default)]
    queries: Vec<String>,
}

pub struct Evaluator {
    llm: Arc<dyn LlmBackend>,
    model: String,
    max_queries: usize,
}

impl Evaluator {
    pub fn new(llm: Arc<dyn LlmBackend>, model: String, max_queries: usize) -> Self {
        Self {
            llm,
            model,
            max_queries,
        }
    }

    /// An insufficient verdict always carries at least one query that has not
    /// been searched yet.
    #[instrument(skip_all, fields(findings = findings.len()))]
    pub async fn evaluate(
        &self,
        goal: &str,
        findings: &[Finding],
        searched: &[String],
        plan_response_id: Option<&str>,
    ) -> Result<(EvaluationVerdict, TokenUsage), LlmError> {
        let data = research_data(findings);
        let request = LlmRequest::new(
            CallKind::Evaluate,
            &self.model,
            vec![
                InputMessage::new(Role::Developer, format!("Research goal: {}", goal)),
                InputMessage::new(Role::Assistant, format!("Research data: {}", data)),
                InputMessage::user(EVALUATION_PROMPT),
            ],
        )
        .instructions(RESEARCHER_INSTRUCTIONS);

        let response = self.llm.respond(&request).await?;
        let mut usage = response.usage;

        let (sufficient, proposed) = parse_evaluation(&response.text);
        if sufficient {
            debug!("research judged sufficient");
            return Ok((EvaluationVerdict::sufficient(), usage));
        }

        let mut queries = self.limit(clean_queries(proposed, searched));
        if queries.is_empty() {
            debug!("evaluator proposed no new queries, asking for follow-ups");
            let (follow_ups, follow_up_usage) = self
                .follow_up_queries(goal, &data, plan_response_id)
                .await?;
            usage += follow_up_usage;
            queries = self.limit(clean_queries(follow_ups, searched));
        }
        if queries.is_empty() {
            let fallback = fallback_query(goal, searched);
            warn!(query = %fallback, "no usable follow-up queries, deriving one from the goal");
            queries.push(fallback);
        }

        Ok((
            EvaluationVerdict {
                is_sufficient: false,
                additional_queries: queries,
            },
            usage,
        ))
    }

    async fn follow_up_queries(
        &self,
        goal: &str,
        data: &str,
        plan_response_id: Option<&str>,
    ) -> Result<(Vec<String>, TokenUsage), LlmError> {
        let request = LlmRequest::new(
            CallKind::FollowUp,
            &self.model,
            vec![
                InputMessage::new(Role::Assistant, format!("Current data: {}", data)),
                InputMessage::user(format!(
                    "This has not met the goal: {}. Write {} other web searches to achieve the goal. \
                     Respond with ONLY a JSON array of query strings.",
                    goal, self.max_queries
                )),
            ],
        )
        .instructions(RESEARCHER_INSTRUCTIONS)
        .chained_to(plan_response_id);

        let response = self.llm.respond(&request).await?;
        let queries = extract_json(&response.text, '[', ']')
            .and_then(|json| serde_json::from_str::<Vec<String>>(json).ok())
            .unwrap_or_else(|| response.text.lines().map(str::to_string).collect());

        Ok((queries, response.usage))
    }

    fn limit(&self, mut queries: Vec<String>) -> Vec<String> {
        queries.truncate(self.max_queries);
        queries
    }
}

/// Sufficiency plus any proposed queries. Falls back to a yes/no reading
/// when the response carries no JSON.
fn parse_evaluation(text: &str) -> (bool, Vec<String>) {
    if let Some(json) = extract_json(text, '{', '}') {
        if let Ok(output) = serde_json::from_str::<EvaluationOutput>(json) {
            return (output.sufficient, output.queries);
        }
    }

    let answer = text.trim().to_lowercase();
    let sufficient = answer.starts_with("yes") || (answer.contains("yes") && !answer.contains("no"));
    (sufficient, Vec::new())
}

fn research_data(findings: &[Finding]) -> String {
    let trimmed: Vec<Finding> = findings
        .iter()
        .map(|f| Finding {
            snippet: truncate(&f.snippet, SNIPPET_LIMIT).to_string(),
            ..f.clone()
        })
        .collect();
    serde_json::to_string(&trimmed).unwrap_or_default()
}

fn fallback_query(goal: &str, searched: &[String]) -> String {
    let goal = goal.trim().trim_end_matches('.');
    FALLBACK_ANGLES
        .iter()
        .map(|angle| format!("{}{}", goal, angle))
        .find(|candidate| !searched.iter().any(|s| s.eq_ignore_ascii_case(candidate)))
        .unwrap_or_else(|| format!("{} (round {})", goal, searched.len() + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use pretty_assertions::assert_eq;

    const GOAL: &str = "Compare grid-scale storage technologies for the EU.";

    fn finding() -> Finding {
        Finding {
            query: "q".into(),
            snippet: "Pumped hydro dominates.".into(),
            citation: None,
        }
    }

    fn evaluator(mock: &Arc<MockBackend>) -> Evaluator {
        Evaluator::new(mock.clone(), "big".into(), 3)
    }

    #[test]
    fn parses_json_and_plain_answers() {
        assert_eq!(parse_evaluation("{\"sufficient\": true}"), (true, vec![]));
        assert_eq!(
            parse_evaluation("```json\n{\"sufficient\": false, \"queries\": [\"a\"]}\n```"),
            (false, vec!["a".to_string()])
        );
        assert_eq!(parse_evaluation("Yes."), (true, vec![]));
        assert_eq!(parse_evaluation("No"), (false, vec![]));
        assert_eq!(parse_evaluation("I'm not sure"), (false, vec![]));
    }

    #[tokio::test]
    async fn sufficient_verdict_has_no_queries() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": true}");

        let (verdict, _) = evaluator(&mock)
            .evaluate(GOAL, &[finding()], &[], None)
            .await
            .unwrap();

        assert_eq!(verdict, EvaluationVerdict::sufficient());
        assert_eq!(mock.calls(CallKind::FollowUp), 0);
    }

    #[tokio::test]
    async fn drops_already_searched_queries_and_caps_count() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_text(
            CallKind::Evaluate,
            "{\"sufficient\": false, \"queries\": [\"old\", \"n1\", \"n2\", \"n3\", \"n4\"]}",
        );

        let (verdict, _) = evaluator(&mock)
            .evaluate(GOAL, &[finding()], &["OLD".to_string()], None)
            .await
            .unwrap();

        assert!(!verdict.is_sufficient);
        assert_eq!(verdict.additional_queries, vec!["n1", "n2", "n3"]);
    }

    #[tokio::test]
    async fn insufficient_without_queries_asks_for_follow_ups() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_text(CallKind::Evaluate, "No");
        mock.queue_text(CallKind::FollowUp, "[\"sodium-ion cost 2024\"]");

        let (verdict, usage) = evaluator(&mock)
            .evaluate(GOAL, &[finding()], &[], Some("resp_plan"))
            .await
            .unwrap();

        assert_eq!(verdict.additional_queries, vec!["sodium-ion cost 2024"]);
        assert_eq!(usage.total(), 300);
        let follow_up = mock
            .requests()
            .into_iter()
            .find(|r| r.kind == CallKind::FollowUp)
            .unwrap();
        assert_eq!(follow_up.previous_response_id.as_deref(), Some("resp_plan"));
    }

    #[tokio::test]
    async fn never_insufficient_without_queries() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_text(CallKind::Evaluate, "{\"sufficient\": false, \"queries\": []}");
        mock.queue_text(CallKind::FollowUp, "[]");
        let searched = vec!["Compare grid-scale storage technologies for the EU".to_string()];

        let (verdict, _) = evaluator(&mock)
            .evaluate(GOAL, &[finding()], &searched, None)
            .await
            .unwrap();

        assert!(!verdict.is_sufficient);
        assert_eq!(
            verdict.additional_queries,
            vec!["Compare grid-scale storage technologies for the EU latest data and statistics"]
        );
    }

    #[tokio::test]
    async fn upstream_failure_is_returned() {
        let mock = Arc::new(MockBackend::new());
        mock.queue(CallKind::Evaluate, Err(LlmError::Api { status: 500, body: "boom".into() }));

        let err = evaluator(&mock)
            .evaluate(GOAL, &[finding()], &[], None)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
