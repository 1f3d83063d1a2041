use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::llm::TokenUsage;
use crate::session::SessionStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundLog {
    pub round: u32,
    pub queries: Vec<String>,
    pub new_findings: u32,
    pub total_findings: u32,
    pub search_latency_ms: u64,
    pub evaluation_latency_ms: u64,
    pub retries: u32,
    pub usage: TokenUsage,
    pub decision: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLog {
    pub id: String,
    pub session_id: String,
    pub timestamp: String,
    pub topic: String,
    pub goal: String,
    pub rounds: Vec<RoundLog>,
    pub status: SessionStatus,
    pub best_effort: bool,
    pub error: Option<String>,
    pub report_latency_ms: u64,
    pub report_usage: TokenUsage,
    pub total_latency_ms: u64,
    pub citations: u32,
}

impl RunLog {
    pub fn new(session_id: String, topic: &str, goal: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
            topic: topic.to_string(),
            goal: goal.to_string(),
            rounds: Vec::new(),
            status: SessionStatus::Planning,
            best_effort: false,
            error: None,
            report_latency_ms: 0,
            report_usage: TokenUsage::default(),
            total_latency_ms: 0,
            citations: 0,
        }
    }

    pub fn total_usage(&self) -> TokenUsage {
        let mut usage = self.report_usage;
        for round in &self.rounds {
            usage += round.usage;
        }
        usage
    }

    pub fn total_findings(&self) -> u32 {
        self.rounds.last().map(|r| r.total_findings).unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "Rounds: {} | Queries: {} | Findings: {} | Citations: {} | Total latency: {:.1}s | Tokens used by LLM: {}",
            self.rounds.len(),
            self.rounds.iter().map(|r| r.queries.len()).sum::<usize>(),
            self.total_findings(),
            self.citations,
            self.total_latency_ms as f64 / 1000.0,
            self.total_usage().total(),
        )
    }
}

pub struct RunLogger {
    dir: PathBuf,
}

impl RunLogger {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("Failed to create logs directory")?;
        Ok(Self { dir })
    }

    pub fn write(&self, run_log: &RunLog) -> Result<()> {
        let path = self.dir.join("runs.jsonl");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open log file")?;

        let json = serde_json::to_string(run_log).context("Failed to serialize run log")?;
        writeln!(file, "{}", json).context("Failed to write log")?;

        Ok(())
    }
}
