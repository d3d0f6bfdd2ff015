use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info};
use std::path::PathBuf;

use papermind::config::Settings;
use papermind::rag::{render_answer, RagEngine};
use papermind::server;

/// Chat with your PDFs: retrieval-augmented answers with page citations
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Add a PDF to the vector index
    Ingest {
        /// Path to the PDF to index
        file_path: PathBuf,
    },
    /// Answer a single question and exit
    Ask {
        /// The question to answer
        question: String,
    },
    /// Ask questions interactively
    Chat,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => server::serve(&settings).await,
        Command::Ingest { file_path } => {
            if !file_path.exists() {
                error!("File not found: {}", file_path.display());
                return Err(anyhow::anyhow!("File not found"));
            }

            let engine = RagEngine::from_settings(&settings).await?;
            let report = engine
                .ingest_file(&file_path)
                .await
                .context("Failed to process document")?;
            info!(
                "Indexed {} ({} pages, {} chunks); index holds {} chunks",
                report.filename, report.pages, report.chunks, report.indexed_chunks
            );
            Ok(())
        }
        Command::Ask { question } => {
            let engine = RagEngine::from_settings(&settings).await?;
            let answer = engine.answer(&question).await.context("Failed to answer")?;
            print!("{}", render_answer(&answer));
            Ok(())
        }
        Command::Chat => {
            let engine = RagEngine::from_settings(&settings).await?;
            engine
                .run_query_loop()
                .await
                .context("Error in query loop")
        }
    }
}
