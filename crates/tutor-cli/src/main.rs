use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use tutor_renderer::document::{MathScript, write_document_footer, write_document_head};
use tutor_renderer::{AnswerView, MathmlTypesetter, SchedulerConfig, normalize, render_answer};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "Tutor - render AI homework answers with typeset math", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair math fencing and print the normalized answer
    Normalize {
        /// Answer file (reads stdin if omitted)
        input: Option<PathBuf>,
    },
    /// Render an answer to HTML
    Render {
        /// Answer file (reads stdin if omitted)
        input: Option<PathBuf>,

        /// Typeset math to MathML before printing
        #[arg(long)]
        typeset: bool,

        /// Wrap the answer in a full HTML document
        #[arg(long)]
        standalone: bool,

        /// Document title for --standalone
        #[arg(long, default_value = "Answer")]
        title: String,

        /// Load MathJax from this directory instead of the CDN
        #[arg(long, env = "TUTOR_MATHJAX_DIR")]
        mathjax_local: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_miette();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Normalize { input } => {
            let raw = read_input(input.as_ref()).await?;
            write_stdout(normalize(&raw).as_str()).await?;
        }
        Commands::Render {
            input,
            typeset,
            standalone,
            title,
            mathjax_local,
        } => {
            let raw = read_input(input.as_ref()).await?;
            let body = if typeset {
                typeset_answer(&raw).await
            } else {
                render_answer(&normalize(&raw))
            };

            if standalone {
                let math = match (typeset, mathjax_local) {
                    (true, _) => MathScript::None,
                    (false, Some(dir)) => MathScript::MathJaxLocal(dir),
                    (false, None) => MathScript::MathJaxCdn,
                };
                let mut stdout = tokio::io::stdout();
                write_document_head(&mut stdout, &title, &math).await?;
                stdout.write_all(body.as_bytes()).await.into_diagnostic()?;
                write_document_footer(&mut stdout).await?;
                stdout.flush().await.into_diagnostic()?;
            } else {
                write_stdout(&body).await?;
            }
        }
    }

    Ok(())
}

/// Runs the answer through a mounted view and returns what it ends up showing.
async fn typeset_answer(raw: &str) -> String {
    let mut view = AnswerView::mount(Arc::new(MathmlTypesetter), SchedulerConfig::from_env());
    view.set_content(raw);
    view.settled().await;
    tracing::debug!(status = ?view.status(), "answer settled");
    let html = view.visible();
    view.unmount().await;
    html
}

async fn read_input(path: Option<&PathBuf>) -> Result<String> {
    match path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to read {}", path.display())),
        None => {
            let mut raw = String::new();
            tokio::io::stdin()
                .read_to_string(&mut raw)
                .await
                .into_diagnostic()
                .wrap_err("failed to read answer from stdin")?;
            Ok(raw)
        }
    }
}

async fn write_stdout(text: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await.into_diagnostic()?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n").await.into_diagnostic()?;
    }
    stdout.flush().await.into_diagnostic()
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn init_miette() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .with_cause_chain()
                .color(true)
                .context_lines(5)
                .tab_width(2)
                .break_words(true)
                .build(),
        )
    }))
    .expect("couldn't set the miette hook");
    miette::set_panic_hook();
}
