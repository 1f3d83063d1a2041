//! Scripted backend for driving the research flow without network access.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{CallKind, LlmBackend, LlmRequest, LlmResponse, TextSegment, TokenUsage};
use crate::error::LlmError;
use crate::session::CancelHandle;

type Reply = Result<LlmResponse, LlmError>;

#[derive(Default)]
struct Script {
    queued: HashMap<CallKind, VecDeque<Reply>>,
    fallback: HashMap<CallKind, Reply>,
    requests: Vec<LlmRequest>,
    cancel_on: Option<(CallKind, usize, CancelHandle)>,
    delays: HashMap<CallKind, Duration>,
}

impl Script {
    fn next_reply(&mut self, request: &LlmRequest) -> Reply {
        self.requests.push(request.clone());
        let served = self
            .requests
            .iter()
            .filter(|r| r.kind == request.kind)
            .count();

        if let Some((kind, nth, handle)) = &self.cancel_on {
            if *kind == request.kind && *nth == served {
                handle.cancel();
            }
        }

        if let Some(reply) = self
            .queued
            .get_mut(&request.kind)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.fallback.get(&request.kind).cloned().unwrap_or_else(|| {
            Err(LlmError::Decode(format!(
                "no scripted reply for {:?} call",
                request.kind
            )))
        })
    }
}

/// Replies are queued per [`CallKind`]; once a queue drains the kind's
/// fallback reply (if any) is returned for every further call.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<Script>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn queue(&self, kind: CallKind, reply: Reply) -> &Self {
        self.script().queued.entry(kind).or_default().push_back(reply);
        self
    }

    pub fn queue_text(&self, kind: CallKind, text: &str) -> &Self {
        self.queue(kind, Ok(Self::text_response(text)))
    }

    pub fn set_fallback(&self, kind: CallKind, reply: Reply) -> &Self {
        self.script().fallback.insert(kind, reply);
        self
    }

    /// Cancel the run behind `handle` while serving the `nth` (1-based)
    /// call of `kind`.
    pub fn cancel_on_call(&self, kind: CallKind, nth: usize, handle: CancelHandle) -> &Self {
        self.script().cancel_on = Some((kind, nth, handle));
        self
    }

    /// Hold every reply of `kind` back for `delay` before returning it.
    pub fn delay(&self, kind: CallKind, delay: Duration) -> &Self {
        self.script().delays.insert(kind, delay);
        self
    }

    pub fn calls(&self, kind: CallKind) -> usize {
        self.script().requests.iter().filter(|r| r.kind == kind).count()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.script().requests.clone()
    }

    pub fn text_response(text: &str) -> LlmResponse {
        LlmResponse::from_segments(
            format!("resp_{}", uuid::Uuid::new_v4().simple()),
            vec![TextSegment {
                text: text.to_string(),
                annotations: Vec::new(),
            }],
            TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
        )
    }

    /// A search reply with one paragraph per `(snippet, url)` pair, each
    /// paragraph fully covered by a `url_citation` annotation.
    pub fn cited_response(sources: &[(&str, &str)]) -> LlmResponse {
        let mut text = String::new();
        let mut annotations = Vec::new();
        for (i, (snippet, url)) in sources.iter().enumerate() {
            if i > 0 {
                text.push_str("\n\n");
            }
            let start = text.chars().count();
            text.push_str(snippet);
            annotations.push(json!({
                "type": "url_citation",
                "url": url,
                "title": format!("Source {}", i + 1),
                "start_index": start,
                "end_index": text.chars().count(),
            }));
        }
        LlmResponse::from_segments(
            format!("resp_{}", uuid::Uuid::new_v4().simple()),
            vec![TextSegment { text, annotations }],
            TokenUsage {
                input_tokens: 200,
                output_tokens: 80,
            },
        )
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn respond(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let (reply, delay) = {
            let mut script = self.script();
            let reply = script.next_reply(request);
            (reply, script.delays.get(&request.kind).copied())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}
