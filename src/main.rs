use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use deep_research::instrumentation::RunLogger;
use deep_research::llm::LlmClient;
use deep_research::{Config, ResearchAssistant, RunResult};

#[derive(Parser)]
#[command(name = "deep-research", about = "Guided web research with cited reports")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose per-round output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the clarifying questions for a topic
    Questions {
        /// The topic to research
        topic: String,
    },
    /// Research a topic end to end and print the report
    Research {
        /// The topic to research
        topic: String,

        /// JSON array of answers to the clarifying questions (prompted on stdin if omitted)
        #[arg(long)]
        answers: Option<PathBuf>,

        /// Write the Markdown report to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Override MAX_ITERATIONS
        #[arg(long)]
        max_iterations: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Commands::Research {
        max_iterations: Some(n),
        ..
    } = &cli.command
    {
        config.settings.max_iterations = *n;
        config.settings.validate()?;
    }

    let llm = LlmClient::new(&config.api_key, &config.base_url, config.request_timeout)
        .context("Failed to build HTTP client")?;
    let assistant = ResearchAssistant::new(Arc::new(llm), config.settings);

    match cli.command {
        Commands::Questions { topic } => {
            let session = assistant.start(&topic).await?;
            for (i, question) in session.questions.iter().enumerate() {
                println!("{}. {}", i + 1, question);
            }
        }
        Commands::Research {
            topic,
            answers,
            output,
            ..
        } => {
            let mut session = assistant.start(&topic).await?;

            let answers = match answers {
                Some(path) => read_answers(&path)?,
                None => prompt_answers(&session.questions)?,
            };
            anyhow::ensure!(
                answers.len() == session.questions.len(),
                "Expected {} answers, got {}",
                session.questions.len(),
                answers.len()
            );

            let plan = assistant.submit_answers(&mut session, answers).await?;
            if cli.verbose {
                eprintln!("[plan] Goal: {}", plan.goal);
                for q in &plan.queries {
                    eprintln!("  - {}", q);
                }
            }

            let handle = session.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling after the current step...");
                    handle.cancel();
                }
            });

            let outcome = assistant.run(session).await;

            if cli.verbose {
                for round in &outcome.log.rounds {
                    eprintln!(
                        "[round {}] {} queries, +{} findings ({} total), search={}ms eval={}ms retries={} → {}",
                        round.round,
                        round.queries.len(),
                        round.new_findings,
                        round.total_findings,
                        round.search_latency_ms,
                        round.evaluation_latency_ms,
                        round.retries,
                        round.decision
                    );
                }
            }

            RunLogger::new("logs")?.write(&outcome.log)?;

            match &outcome.result {
                RunResult::Completed {
                    report,
                    best_effort,
                } => {
                    if *best_effort {
                        eprintln!("Iteration cap reached; report is best-effort.");
                    }
                    let markdown = report.to_markdown();
                    println!("\n{}\n", markdown);
                    if let Some(path) = output {
                        std::fs::write(&path, &markdown)
                            .context(format!("Failed to write report to {}", path.display()))?;
                        eprintln!("Report written to {}", path.display());
                    }
                }
                RunResult::Failed(e) => {
                    eprintln!("Research failed: {}", e);
                    report_partial(outcome.findings.len());
                }
                RunResult::Cancelled => {
                    eprintln!("Research cancelled.");
                    report_partial(outcome.findings.len());
                }
            }
            println!("{}", outcome.log.summary());
        }
    }

    Ok(())
}

fn read_answers(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .context(format!("Failed to open answers file: {}", path.display()))?;
    serde_json::from_str(&raw).context("Answers file must be a JSON array of strings")
}

fn prompt_answers(questions: &[String]) -> Result<Vec<String>> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut answers = Vec::with_capacity(questions.len());

    for (i, question) in questions.iter().enumerate() {
        loop {
            eprint!("{}. {}\n> ", i + 1, question);
            std::io::stderr().flush().ok();
            let line = lines
                .next()
                .context("stdin closed before all questions were answered")?
                .context("Failed to read answer")?;
            if !line.trim().is_empty() {
                answers.push(line.trim().to_string());
                break;
            }
        }
    }

    Ok(answers)
}

fn report_partial(findings: usize) {
    if findings == 0 {
        eprintln!("No findings were collected.");
    } else {
        eprintln!("{} findings were collected before the run stopped.", findings);
    }
}
