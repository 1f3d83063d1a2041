use std::ops::Range;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::RESEARCHER_INSTRUCTIONS;
use crate::error::LlmError;
use crate::llm::{CallKind, InputMessage, LlmBackend, LlmRequest, LlmResponse, TextSegment};
use crate::session::{Citation, Finding};

/// The `url_citation` annotation shape. Every field is optional here;
/// [`Annotation::into_citation`] decides whether the annotation is usable.
#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    title: Option<String>,
    start_index: Option<usize>,
    end_index: Option<usize>,
}

impl Annotation {
    /// Cited character span and citation, or `None` if malformed.
    fn into_citation(self, text_chars: usize) -> Option<(Range<usize>, Citation)> {
        if self.kind.as_deref() != Some("url_citation") {
            return None;
        }
        let raw_url = self.url?.trim().to_string();
        let url = url::Url::parse(&raw_url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let (start, end) = (self.start_index?, self.end_index?);
        if start > end || end > text_chars {
            return None;
        }
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Some((
            start..end,
            Citation {
                url: raw_url,
                title,
            },
        ))
    }
}

pub struct SearchClient {
    llm: Arc<dyn LlmBackend>,
    model: String,
}

impl SearchClient {
    pub fn new(llm: Arc<dyn LlmBackend>, model: String) -> Self {
        Self { llm, model }
    }

    #[instrument(skip(self))]
    pub async fn search(&self, query: &str) -> Result<(Vec<Finding>, LlmResponse), LlmError> {
        let request = LlmRequest::new(
            CallKind::Search,
            &self.model,
            vec![InputMessage::user(format!("search: {}", query))],
        )
        .instructions(RESEARCHER_INSTRUCTIONS)
        .with_web_search();

        let response = self.llm.respond(&request).await?;
        let findings = extract_findings(query, &response.segments);
        debug!(findings = findings.len(), "search complete");

        Ok((findings, response))
    }
}

/// Split each segment into paragraphs and attach every valid citation to the
/// paragraph containing the end of its cited span.
pub fn extract_findings(query: &str, segments: &[TextSegment]) -> Vec<Finding> {
    let mut findings = Vec::new();

    for segment in segments {
        let chars = segment.text.chars().count();
        let paragraphs = paragraphs(&segment.text);
        let mut cited: Vec<Vec<Citation>> = vec![Vec::new(); paragraphs.len()];

        for raw in &segment.annotations {
            let parsed = serde_json::from_value::<Annotation>(raw.clone())
                .ok()
                .and_then(|a| a.into_citation(chars));
            let Some((span, citation)) = parsed else {
                warn!(annotation = %raw, "skipping malformed annotation");
                continue;
            };
            let anchor = span.end.saturating_sub(1).max(span.start);
            let Some(index) = paragraphs
                .iter()
                .position(|(range, _)| range.contains(&anchor) || range.end == anchor)
            else {
                warn!(annotation = %raw, anchor, "skipping annotation outside any paragraph");
                continue;
            };
            if !cited[index].iter().any(|c| c.url == citation.url) {
                cited[index].push(citation);
            }
        }

        for ((_, text), citations) in paragraphs.into_iter().zip(cited) {
            if citations.is_empty() {
                if !is_heading(text) {
                    findings.push(Finding {
                        query: query.to_string(),
                        snippet: text.to_string(),
                        citation: None,
                    });
                }
                continue;
            }
            for citation in citations {
                findings.push(Finding {
                    query: query.to_string(),
                    snippet: text.to_string(),
                    citation: Some(citation),
                });
            }
        }
    }

    findings
}

/// Non-blank paragraphs (separated by blank lines), trimmed, with the
/// character range each occupies in `text`.
fn paragraphs(text: &str) -> Vec<(Range<usize>, &str)> {
    let mut out = Vec::new();
    let mut char_pos = 0;

    for block in text.split("\n\n") {
        let block_chars = block.chars().count();
        let trimmed_start = block.len() - block.trim_start().len();
        let trimmed = block.trim();
        if !trimmed.is_empty() {
            let start = char_pos + block[..trimmed_start].chars().count();
            let end = start + trimmed.chars().count();
            out.push((start..end, trimmed));
        }
        char_pos += block_chars + 2;
    }

    out
}

fn is_heading(text: &str) -> bool {
    !text.contains('\n') && text.starts_with('#')
}
