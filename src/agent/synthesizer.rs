use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::{debug, instrument};

use super::RESEARCHER_INSTRUCTIONS;
use crate::error::{ResearchError, Stage};
use crate::llm::{CallKind, InputMessage, LlmBackend, LlmRequest, LlmResponse, Role};
use crate::session::{Citation, Finding, Report};

const SYSTEM_PROMPT: &str = r#"You are a research report writer. Given a research goal and findings gathered across several rounds of web searches, write a complete and detailed report.

Guidelines:
- Synthesize the findings into a coherent, well-structured report in Markdown
- Cite sources inline using [n], where n is the source number shown with each finding
- Only cite source numbers that appear in the findings
- Findings marked [uncited] may inform the text but cannot be cited
- If the evidence is insufficient or contradictory, say so
- Do not append a reference list; one is added automatically"#;

/// Bracketed numbers at least this large are years or quantities, never
/// source numbers.
const NON_CITATION_MIN: usize = 1000;

static MARKER_PATTERN: OnceLock<Regex> = OnceLock::new();

/// Matches `[3]` and `[1, 4]` style markers.
fn marker_pattern() -> &'static Regex {
    MARKER_PATTERN.get_or_init(|| {
        Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]")
            .expect("Static regex pattern is guaranteed to be valid")
    })
}

pub struct Synthesizer {
    llm: Arc<dyn LlmBackend>,
    model: String,
}

impl Synthesizer {
    pub fn new(llm: Arc<dyn LlmBackend>, model: String) -> Self {
        Self { llm, model }
    }

    #[instrument(skip_all, fields(findings = findings.len()))]
    pub async fn synthesize(
        &self,
        goal: &str,
        findings: &[Finding],
    ) -> Result<(Report, LlmResponse), ResearchError> {
        let sources = unique_citations(findings);
        let source_numbers: HashMap<&str, usize> = sources
            .iter()
            .enumerate()
            .map(|(i, c)| (c.url.as_str(), i + 1))
            .collect();

        let context_text = findings
            .iter()
            .map(|f| {
                let label = match &f.citation {
                    Some(c) => format!("[{}]", source_numbers[c.url.as_str()]),
                    None => "[uncited]".to_string(),
                };
                format!("{} (query: {}) {}", label, f.query, f.snippet)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let request = LlmRequest::new(
            CallKind::Report,
            &self.model,
            vec![
                InputMessage::new(Role::Developer, SYSTEM_PROMPT),
                InputMessage::user(format!(
                    "Research goal: {}\n\nFindings:\n{}",
                    goal, context_text
                )),
            ],
        )
        .instructions(RESEARCHER_INSTRUCTIONS);

        let response = self
            .llm
            .respond(&request)
            .await
            .map_err(|e| ResearchError::generation(Stage::Report, e))?;
        if response.text.trim().is_empty() {
            return Err(ResearchError::generation(Stage::Report, "model returned an empty report"));
        }

        let report = renumber_citations(&response.text, &sources);
        debug!(
            sources = sources.len(),
            cited = report.citations.len(),
            "report generated"
        );

        Ok((report, response))
    }
}

/// Citations deduplicated by URL, in first-seen order.
pub fn unique_citations(findings: &[Finding]) -> Vec<Citation> {
    let mut seen: Vec<Citation> = Vec::new();
    for citation in findings.iter().filter_map(|f| f.citation.as_ref()) {
        match seen.iter_mut().find(|c| c.url == citation.url) {
            Some(existing) => {
                if existing.title.is_none() {
                    existing.title = citation.title.clone();
                }
            }
            None => seen.push(citation.clone()),
        }
    }
    seen
}

/// Rewrite `[n]` markers so they number only the sources actually cited, in
/// order of first appearance. Markers pointing outside `sources` are removed,
/// except bracketed years and other large numbers, which are left as written.
fn renumber_citations(text: &str, sources: &[Citation]) -> Report {
    let mut order: Vec<usize> = Vec::new();

    let rewritten = marker_pattern().replace_all(text, |caps: &Captures| {
        let parsed: Vec<usize> = caps[1]
            .split(',')
            .filter_map(|n| n.trim().parse::<usize>().ok())
            .collect();
        let in_range = |n: &usize| *n > 0 && *n <= sources.len();
        if !parsed.iter().any(in_range) && parsed.iter().any(|&n| n >= NON_CITATION_MIN) {
            return caps[0].to_string();
        }

        let mut numbers: Vec<usize> = Vec::new();
        for n in parsed {
            if n == 0 || n > sources.len() {
                continue;
            }
            let position = match order.iter().position(|&o| o == n) {
                Some(p) => p + 1,
                None => {
                    order.push(n);
                    order.len()
                }
            };
            if !numbers.contains(&position) {
                numbers.push(position);
            }
        }
        if numbers.is_empty() {
            String::new()
        } else {
            let joined = numbers
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            format!("[{}]", joined)
        }
    });

    Report {
        text: rewritten.into_owned(),
        citations: order.iter().map(|&n| sources[n - 1].clone()).collect(),
    }
}
