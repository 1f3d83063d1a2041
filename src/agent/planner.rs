use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use super::{clean_queries, extract_json, RESEARCHER_INSTRUCTIONS};
use crate::error::{ResearchError, Stage};
use crate::llm::{CallKind, InputMessage, LlmBackend, LlmRequest, LlmResponse};
use crate::session::ResearchPlan;

#[derive(Deserialize)]
struct PlanOutput {
    goal: String,
    #[serde(default)]
    queries: Vec<String>,
}

pub struct Planner {
    llm: Arc<dyn LlmBackend>,
    model: String,
    query_count: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmBackend>, model: String, query_count: usize) -> Self {
        Self {
            llm,
            model,
            query_count,
        }
    }

    #[instrument(skip(self, questions, answers, previous_response_id))]
    pub async fn plan(
        &self,
        topic: &str,
        questions: &[String],
        answers: &[String],
        previous_response_id: Option<&str>,
    ) -> Result<(ResearchPlan, LlmResponse), ResearchError> {
        if answers.len() != questions.len() {
            return Err(ResearchError::generation(
                Stage::Plan,
                format!(
                    "{} answers given for {} questions",
                    answers.len(),
                    questions.len()
                ),
            ));
        }
        if let Some(i) = answers.iter().position(|a| a.trim().is_empty()) {
            return Err(ResearchError::generation(
                Stage::Plan,
                format!("answer to question {} is empty", i + 1),
            ));
        }

        let exchange = questions
            .iter()
            .zip(answers)
            .enumerate()
            .map(|(i, (q, a))| format!("Q{}: {}\nA{}: {}", i + 1, q, i + 1, a.trim()))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Research topic: {topic}\n\nClarifying questions and the user's answers:\n{exchange}\n\n\
             Using these answers, write one goal sentence describing what complete research \
             on this topic must cover, and {n} web search queries that will reach it.\n\
             Respond with ONLY a JSON object in this format:\n\
             {{\"goal\": \"...\", \"queries\": [\"query 1\", \"query 2\"]}}",
            n = self.query_count
        );
        let request = LlmRequest::new(CallKind::Plan, &self.model, vec![InputMessage::user(prompt)])
            .instructions(RESEARCHER_INSTRUCTIONS)
            .chained_to(previous_response_id);

        let response = self
            .llm
            .respond(&request)
            .await
            .map_err(|e| ResearchError::generation(Stage::Plan, e))?;

        let plan = parse_plan(&response.text, self.query_count)?;
        debug!(goal = %plan.goal, queries = plan.queries.len(), "research plan ready");

        Ok((plan, response))
    }
}

fn parse_plan(text: &str, query_count: usize) -> Result<ResearchPlan, ResearchError> {
    let json = extract_json(text, '{', '}')
        .ok_or_else(|| ResearchError::generation(Stage::Plan, "response contains no JSON object"))?;
    let output: PlanOutput =
        serde_json::from_str(json).map_err(|e| ResearchError::generation(Stage::Plan, e))?;

    let goal = output.goal.trim().to_string();
    if goal.is_empty() {
        return Err(ResearchError::generation(Stage::Plan, "goal is empty"));
    }

    let mut queries = clean_queries(output.queries, &[]);
    queries.truncate(query_count);
    if queries.is_empty() {
        return Err(ResearchError::generation(Stage::Plan, "no search queries returned"));
    }

    Ok(ResearchPlan { goal, queries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockBackend;
    use pretty_assertions::assert_eq;

    fn qa() -> (Vec<String>, Vec<String>) {
        (
            vec!["Audience?".into(), "Region?".into()],
            vec!["Policy makers".into(), "EU".into()],
        )
    }

    #[test]
    fn parses_fenced_json_and_truncates_queries() {
        let text = "Here is the plan:\n```json\n{\"goal\": \"Assess EU grid storage\", \
                    \"queries\": [\"a\", \"b\", \"b\", \"c\", \"d\"]}\n```";
        let plan = parse_plan(text, 3).unwrap();
        assert_eq!(plan.goal, "Assess EU grid storage");
        assert_eq!(plan.queries, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_plan_without_queries() {
        let err = parse_plan("{\"goal\": \"g\", \"queries\": [\"  \"]}", 3).unwrap_err();
        assert!(err.to_string().contains("no search queries"));
    }

    #[tokio::test]
    async fn chains_to_question_response() {
        let mock = Arc::new(MockBackend::new());
        mock.queue_text(
            CallKind::Plan,
            "{\"goal\": \"Assess storage\", \"queries\": [\"q1\", \"q2\", \"q3\"]}",
        );
        let planner = Planner::new(mock.clone(), "big".into(), 3);
        let (questions, answers) = qa();

        let (plan, _) = planner
            .plan("storage", &questions, &answers, Some("resp_q"))
            .await
            .unwrap();

        assert_eq!(plan.queries.len(), 3);
        let request = &mock.requests()[0];
        assert_eq!(request.previous_response_id.as_deref(), Some("resp_q"));
        assert!(request.input[0].content.contains("A2: EU"));
    }

    #[tokio::test]
    async fn blank_answer_is_rejected_before_calling_upstream() {
        let mock = Arc::new(MockBackend::new());
        let planner = Planner::new(mock.clone(), "big".into(), 3);
        let (questions, _) = qa();

        let err = planner
            .plan("storage", &questions, &["ok".to_string(), " ".to_string()], None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("question 2"));
        assert_eq!(mock.calls(CallKind::Plan), 0);
    }

    #[tokio::test]
    async fn mismatched_answer_count_is_rejected() {
        let mock = Arc::new(MockBackend::new());
        let planner = Planner::new(mock, "big".into(), 3);
        let (questions, _) = qa();

        assert!(planner
            .plan("storage", &questions, &["only one".to_string()], None)
            .await
            .is_err());
    }
}
