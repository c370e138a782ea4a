//! Handoff agent CLI - hands a delivery to a reviewer and waits for feedback

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use handoff_cli::{Finalizer, HandoffClient, Outcome, WaitConfig, WaitRequest, Waiter};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "handoff-cli")]
#[command(about = "Hand a delivery to a human reviewer and block until they respond")]
#[command(version)]
struct Cli {
    /// Delivery title shown to the reviewer
    #[arg(long)]
    title: Option<String>,

    /// Identifies the waiting agent; a new delivery replaces the session's previous one
    #[arg(long)]
    agent_session_id: Option<String>,

    /// Conversation thread (generated if absent)
    #[arg(long)]
    thread_id: Option<String>,

    #[arg(long, env = "HANDOFF_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, env = "HANDOFF_PORT", default_value_t = 3847)]
    port: u16,

    /// Seconds to wait for feedback
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// UI spec as a JSON object
    #[arg(long)]
    ui_spec: Option<String>,

    /// File containing a UI spec JSON object
    #[arg(long)]
    ui_spec_file: Option<PathBuf>,

    /// Generated HTML document
    #[arg(long)]
    html: Option<String>,

    /// File containing a generated HTML document
    #[arg(long)]
    html_file: Option<PathBuf>,

    #[arg(long)]
    project_name: Option<String>,

    #[arg(long)]
    task_name: Option<String>,
}

impl Cli {
    /// Build the delivery content from exactly one content flag
    fn content(&self) -> Result<Value> {
        let given = [
            self.ui_spec.is_some(),
            self.ui_spec_file.is_some(),
            self.html.is_some(),
            self.html_file.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if given != 1 {
            return Err(anyhow!(
                "exactly one of --ui-spec, --ui-spec-file, --html, --html-file is required"
            ));
        }

        if let Some(html) = &self.html {
            return Ok(json!({"type": "generated_html", "html": html}));
        }
        if let Some(path) = &self.html_file {
            let html = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            return Ok(json!({"type": "generated_html", "html": html}));
        }

        let raw = match (&self.ui_spec, &self.ui_spec_file) {
            (Some(raw), _) => raw.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
            (None, None) => return Err(anyhow!("no content flag given")),
        };
        let ui_spec: Value = serde_json::from_str(&raw).context("--ui-spec is not valid JSON")?;
        if !ui_spec.is_object() {
            return Err(anyhow!("--ui-spec must be a JSON object"));
        }
        Ok(json!({"type": "ui_spec", "ui_spec": ui_spec}))
    }

    fn metadata(&self) -> Option<Value> {
        let mut map = Map::new();
        if let Some(project) = &self.project_name {
            map.insert("project_name".into(), Value::String(project.clone()));
        }
        if let Some(task) = &self.task_name {
            map.insert("task_name".into(), Value::String(task.clone()));
        }
        (!map.is_empty()).then_some(Value::Object(map))
    }
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries only the result line
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handoff_cli=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    // Installed before any network work
    let interrupt = interrupt_signal();
    let outcome = run(cli, interrupt).await;

    let finalizer = Finalizer::new();
    if let Err(e) = finalizer.finalize(&outcome, std::io::stdout().lock()) {
        tracing::error!("Failed to write result: {}", e);
    }
    std::process::exit(outcome.exit_code());
}

async fn run(cli: Cli, interrupt: impl Future<Output = ()>) -> Outcome {
    let content = match cli.content() {
        Ok(content) => content,
        Err(e) => return Outcome::error("validation_error", format!("{:#}", e)),
    };

    let client = match HandoffClient::new(format!("http://{}:{}", cli.host, cli.port)) {
        Ok(client) => client,
        Err(e) => return Outcome::error(e.code(), e.to_string()),
    };

    let config = WaitConfig {
        timeout: Duration::from_secs(cli.timeout),
        ..WaitConfig::default()
    };
    let request = WaitRequest {
        agent_session_id: cli.agent_session_id.clone().unwrap_or_default(),
        thread_id: cli
            .thread_id
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        title: cli.title.clone().unwrap_or_default(),
        metadata: cli.metadata(),
        content,
    };

    Waiter::new(client, config)
        .run(request, interrupt)
        .await
}

/// Resolves on SIGINT or SIGTERM. Registration happens when this is called,
/// not when the future is first polled.
#[cfg(unix)]
fn interrupt_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let interrupt = signal(SignalKind::interrupt());
    let terminate = signal(SignalKind::terminate());
    async move {
        tokio::select! {
            _ = recv_or_pending(interrupt) => {},
            _ = recv_or_pending(terminate) => {},
        }
    }
}

#[cfg(unix)]
async fn recv_or_pending(signal: std::io::Result<tokio::signal::unix::Signal>) {
    match signal {
        Ok(mut signal) => {
            signal.recv().await;
        }
        Err(e) => {
            tracing::warn!("Could not install signal handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
fn interrupt_signal() -> impl Future<Output = ()> {
    async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
