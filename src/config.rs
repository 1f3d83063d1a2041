use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

/// Tunables the research core runs with. The core never reads the
/// environment; callers build this directly or via [`Config::from_env`].
#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub research_model: String,
    pub question_model: String,
    pub question_count: usize,
    pub initial_query_count: usize,
    pub max_follow_up_queries: usize,
    pub max_iterations: usize,
    pub max_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            research_model: "gpt-4.1".into(),
            question_model: "gpt-4.1-mini".into(),
            question_count: 5,
            initial_query_count: 5,
            max_follow_up_queries: 5,
            max_iterations: 5,
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl ResearchSettings {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.question_count > 0, "CLARIFYING_QUESTIONS must be at least 1");
        anyhow::ensure!(self.initial_query_count > 0, "INITIAL_QUERIES must be at least 1");
        anyhow::ensure!(
            self.max_follow_up_queries > 0,
            "MAX_FOLLOW_UP_QUERIES must be at least 1"
        );
        anyhow::ensure!(self.max_iterations > 0, "MAX_ITERATIONS must be at least 1");
        anyhow::ensure!(!self.research_model.is_empty(), "RESEARCH_MODEL must not be empty");
        anyhow::ensure!(!self.question_model.is_empty(), "QUESTION_MODEL must not be empty");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    pub settings: ResearchSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = ResearchSettings::default();
        let settings = ResearchSettings {
            research_model: std::env::var("RESEARCH_MODEL").unwrap_or(defaults.research_model),
            question_model: std::env::var("QUESTION_MODEL").unwrap_or(defaults.question_model),
            question_count: parse_var("CLARIFYING_QUESTIONS", defaults.question_count)?,
            initial_query_count: parse_var("INITIAL_QUERIES", defaults.initial_query_count)?,
            max_follow_up_queries: parse_var(
                "MAX_FOLLOW_UP_QUERIES",
                defaults.max_follow_up_queries,
            )?,
            max_iterations: parse_var("MAX_ITERATIONS", defaults.max_iterations)?,
            max_retries: parse_var("MAX_RETRIES", defaults.max_retries)?,
            retry_backoff: Duration::from_millis(parse_var("RETRY_BACKOFF_MS", 500)?),
        };
        settings.validate()?;

        let timeout_secs: u64 = parse_var("REQUEST_TIMEOUT_SECS", 120)?;
        anyhow::ensure!(timeout_secs > 0, "REQUEST_TIMEOUT_SECS must be at least 1");

        Ok(Self {
            api_key: std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?,
            base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
            request_timeout: Duration::from_secs(timeout_secs),
            settings,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number", name)),
        Err(_) => Ok(default),
    }
}
