use std::sync::Arc;

use tracing::{debug, instrument};

use super::{strip_list_marker, RESEARCHER_INSTRUCTIONS};
use crate::error::{ResearchError, Stage};
use crate::llm::{CallKind, InputMessage, LlmBackend, LlmRequest, LlmResponse};

pub struct QuestionGenerator {
    llm: Arc<dyn LlmBackend>,
    model: String,
    count: usize,
}

impl QuestionGenerator {
    pub fn new(llm: Arc<dyn LlmBackend>, model: String, count: usize) -> Self {
        Self { llm, model, count }
    }

    #[instrument(skip(self))]
    pub async fn generate(&self, topic: &str) -> Result<(Vec<String>, LlmResponse), ResearchError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ResearchError::generation(Stage::Questions, "topic is empty"));
        }

        let prompt = format!(
            "Ask {} numbered clarifying questions to the user about the topic: {}.\n\
             The questions should uncover the intended purpose and scope of the research.\n\
             Reply only with the questions, one per line.",
            self.count, topic
        );
        let request = LlmRequest::new(CallKind::Questions, &self.model, vec![InputMessage::user(prompt)])
            .instructions(RESEARCHER_INSTRUCTIONS);

        let response = self
            .llm
            .respond(&request)
            .await
            .map_err(|e| ResearchError::generation(Stage::Questions, e))?;

        let questions = parse_questions(&response.text, self.count);
        debug!(parsed = questions.len(), wanted = self.count, "parsed clarifying questions");
        if questions.len() < self.count {
            return Err(ResearchError::generation(
                Stage::Questions,
                format!(
                    "expected {} distinct questions, model returned {}",
                    self.count,
                    questions.len()
                ),
            ));
        }

        Ok((questions, response))
    }
}

/// One question per non-blank line, list markers removed, duplicates dropped,
/// at most `limit` kept.
fn parse_questions(text: &str, limit: usize) -> Vec<String> {
    let mut questions: Vec<String> = Vec::new();
    for line in text.lines() {
        let question = strip_list_marker(line);
        if question.is_empty() {
            continue;
        }
        if questions.iter().any(|q| q.eq_ignore_ascii_case(question)) {
            continue;
        }
        questions.push(question.to_string());
        if questions.len() == limit {
            break;
        }
    }
    questions
}
