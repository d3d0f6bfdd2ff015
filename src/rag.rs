use crate::chunking::{Chunker, ChunkingConfig};
use crate::config::{BackendConfig, IndexMode, Settings};
use crate::document::Document;
use crate::embeddings::Embedder;
use crate::error::{RagError, Result};
use crate::gemini::GeminiClient;
use crate::generation::{
    build_prompt, extract_answer, AnswerStyle, EchoFilter, Generator, TokenStream, APOLOGY_REPLY,
    EMPTY_QUESTION_REPLY, INSUFFICIENT_CONTEXT_REPLY,
};
use crate::history::{ChatHistory, Turn};
use crate::ollama::OllamaClient;
use crate::vector_store::{IndexSnapshot, IndexStore, SearchHit, VectorIndex};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};

const CLI_CONVERSATION: &str = "cli";

/// Tunables of the two pipelines
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub chunking: ChunkingConfig,
    pub top_k: NonZeroUsize,
    pub snippet_chars: usize,
    pub index_mode: IndexMode,
    pub history_turns: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            chunking: ChunkingConfig::default(),
            top_k: NonZeroUsize::new(3).unwrap_or(NonZeroUsize::MIN),
            snippet_chars: 150,
            index_mode: IndexMode::Merge,
            history_turns: 10,
        }
    }
}

/// Where an answer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceCitation {
    /// 1-based rank among the retrieved chunks
    pub index: usize,
    pub file: String,
    pub page: usize,
    pub snippet: String,
}

/// Answer to a chat question
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatAnswer {
    pub response: String,
    pub sources: Vec<SourceCitation>,
}

/// Per-question settings of a chat request
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Conversation whose earlier turns are fed to the model; none means a
    /// one-off question that is not remembered
    pub conversation: Option<String>,
    pub style: AnswerStyle,
}

/// What a streamed answer sends, in order: zero or more tokens, then the
/// complete answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerEvent {
    Token(String),
    Complete(ChatAnswer),
}

/// A question after retrieval, before generation
#[derive(Debug)]
pub enum PreparedAnswer {
    /// Answered without the generator
    Ready(ChatAnswer),
    Generate(PendingAnswer),
}

#[derive(Debug)]
pub struct PendingAnswer {
    question: String,
    prompt: String,
    sources: Vec<SourceCitation>,
    conversation: Option<String>,
}

/// Outcome of ingesting one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub filename: String,
    pub pages: usize,
    pub chunks: usize,
    /// Entries in the active index after this ingestion
    pub indexed_chunks: usize,
}

/// RAG (Retrieval-Augmented Generation) engine.
///
/// Holds the model backends and the active vector index for the lifetime of
/// the process. Queries share the index through an `Arc`; ingestions are
/// serialized and only swap the index in after it has been written to disk.
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    store: IndexStore,
    chunker: Chunker,
    options: EngineOptions,
    history: ChatHistory,
    active: RwLock<Option<Arc<IndexSnapshot>>>,
    ingest_lock: Mutex<()>,
}

impl RagEngine {
    /// Create an engine with no index loaded
    pub fn new(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: IndexStore,
        options: EngineOptions,
    ) -> Self {
        RagEngine {
            embedder,
            generator,
            store,
            chunker: Chunker::new(options.chunking),
            history: ChatHistory::new(options.history_turns),
            options,
            active: RwLock::new(None),
            ingest_lock: Mutex::new(()),
        }
    }

    /// Create an engine and load whatever index is already on disk
    pub async fn open(
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        store: IndexStore,
        options: EngineOptions,
    ) -> Result<Self> {
        let engine = Self::new(embedder, generator, store, options);
        engine.reload_index().await?;
        Ok(engine)
    }

    /// Connect the configured backend and open the index
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let (embedder, generator): (Arc<dyn Embedder>, Arc<dyn Generator>) =
            match &settings.backend {
                BackendConfig::Ollama(config) => {
                    let client = Arc::new(OllamaClient::new(
                        config.clone(),
                        settings.request_timeout,
                    )?);
                    (client.clone() as Arc<dyn Embedder>, client as Arc<dyn Generator>)
                }
                BackendConfig::Gemini(config) => {
                    let client = Arc::new(GeminiClient::new(
                        config.clone(),
                        settings.request_timeout,
                    )?);
                    (client.clone() as Arc<dyn Embedder>, client as Arc<dyn Generator>)
                }
            };

        let options = EngineOptions {
            chunking: settings.chunking,
            top_k: settings.top_k,
            snippet_chars: settings.snippet_chars,
            index_mode: settings.index_mode,
            history_turns: settings.history_turns,
        };

        let store = IndexStore::open(&settings.index_path).await?;
        let engine = Self::open(embedder, generator, store, options).await?;
        Ok(engine)
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    /// Re-read the index from disk, replacing the in-memory one.
    ///
    /// Returns `false` when no index has been saved yet. Waits for a running
    /// ingestion to finish first.
    pub async fn reload_index(&self) -> Result<bool> {
        let _guard = self.ingest_lock.lock().await;

        if !self.store.exists().await? {
            info!(
                "No vector index at {} yet; upload a document to create one",
                self.store.root().display()
            );
            *self.active.write().await = None;
            return Ok(false);
        }

        let index = self.store.load().await?;
        if !index.is_empty() && index.model() != self.embedder.model() {
            warn!(
                "Index was built with embedding model '{}' but '{}' is configured; search quality will suffer",
                index.model(),
                self.embedder.model()
            );
        }

        info!(
            "Loaded vector index with {} chunks from {} document(s)",
            index.len(),
            index.sources().len()
        );
        *self.active.write().await = Some(Arc::new(index));
        Ok(true)
    }

    /// Drop the in-memory index. Queries fail until the next reload or ingest.
    pub async fn unload_index(&self) {
        let _guard = self.ingest_lock.lock().await;
        *self.active.write().await = None;
    }

    /// The active index
    pub async fn current_index(&self) -> Result<Arc<IndexSnapshot>> {
        self.active
            .read()
            .await
            .clone()
            .ok_or_else(|| RagError::IndexNotFound(self.store.root().display().to_string()))
    }

    /// Process a file: load, chunk, embed, and persist the updated index
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestReport> {
        let _guard = self.ingest_lock.lock().await;

        let owned_path = path.to_path_buf();
        let document = tokio::task::spawn_blocking(move || Document::from_file(owned_path))
            .await
            .map_err(join_error)??;

        let pages = document.page_count();
        let chunks = self.chunker.split_pages(&document.pages);
        info!(
            "Split {} ({} pages) into {} chunks",
            document.file_name,
            pages,
            chunks.len()
        );
        let chunk_count = chunks.len();

        let fresh = VectorIndex::build(chunks, self.embedder.as_ref()).await?;
        debug!("Embedded {} chunks with {}", fresh.len(), fresh.model());

        let combined = match self.options.index_mode {
            IndexMode::Merge => self.stored_entries().await?.merge(fresh)?,
            IndexMode::Replace => fresh,
        };

        let snapshot = self.store.save(&combined).await?;
        let indexed_chunks = snapshot.len();
        *self.active.write().await = Some(Arc::new(snapshot));

        info!(
            "Ingested {}: index now holds {} chunks",
            document.file_name, indexed_chunks
        );

        Ok(IngestReport {
            filename: document.file_name,
            pages,
            chunks: chunk_count,
            indexed_chunks,
        })
    }

    /// Entries already on disk. Read from the store rather than the active
    /// index, which may have been unloaded.
    async fn stored_entries(&self) -> Result<VectorIndex> {
        if !self.store.exists().await? {
            return Ok(VectorIndex::empty(self.embedder.model()));
        }
        self.store.load().await?.to_index().await
    }

    /// The `k` chunks closest to `question`
    pub async fn retrieve(&self, question: &str, k: NonZeroUsize) -> Result<Vec<SearchHit>> {
        let index = self.current_index().await?;
        let query = self.embedder.embed(question).await?;
        index.search(&query, k).await
    }

    /// Answer a one-off question from the indexed documents
    pub async fn answer(&self, question: &str) -> Result<ChatAnswer> {
        self.answer_with(question, &AskOptions::default()).await
    }

    /// Answer a question from the indexed documents.
    ///
    /// Retrieval failures are returned as errors. Generation failures are
    /// not: the answer degrades to an apology and the sources are kept.
    pub async fn answer_with(&self, question: &str, ask: &AskOptions) -> Result<ChatAnswer> {
        let pending = match self.prepare_answer(question, ask).await? {
            PreparedAnswer::Ready(answer) => return Ok(answer),
            PreparedAnswer::Generate(pending) => pending,
        };

        let generated = match self.generator.generate(&pending.prompt).await {
            Ok(generated) => extract_answer(&generated),
            Err(e) => Err(e),
        };
        Ok(self.finish(pending, generated).await)
    }

    /// Retrieve context and compose the prompt for `question`
    pub async fn prepare_answer(&self, question: &str, ask: &AskOptions) -> Result<PreparedAnswer> {
        let question = question.trim();
        if question.is_empty() {
            return Ok(PreparedAnswer::Ready(ChatAnswer {
                response: EMPTY_QUESTION_REPLY.to_string(),
                sources: Vec::new(),
            }));
        }

        let hits = self.retrieve(question, self.options.top_k).await?;
        if hits.is_empty() {
            info!("No indexed chunks to answer from");
            return Ok(PreparedAnswer::Ready(ChatAnswer {
                response: INSUFFICIENT_CONTEXT_REPLY.to_string(),
                sources: Vec::new(),
            }));
        }

        // Create context from chunks
        let context = hits
            .iter()
            .map(|hit| hit.chunk.text.as_str())
            .collect::<Vec<&str>>()
            .join("\n\n");
        let history = match &ask.conversation {
            Some(conversation) => self.history.turns(conversation).await,
            None => Vec::new(),
        };

        Ok(PreparedAnswer::Generate(PendingAnswer {
            question: question.to_string(),
            prompt: build_prompt(&context, question, &history, ask.style),
            sources: citations(&hits, self.options.snippet_chars),
            conversation: ask.conversation.clone(),
        }))
    }

    /// Generate a prepared answer, sending its text to `events` as the model
    /// produces it and the complete answer last
    pub async fn stream_answer(&self, prepared: PreparedAnswer, events: mpsc::Sender<AnswerEvent>) {
        let pending = match prepared {
            PreparedAnswer::Ready(answer) => {
                let _ = events.send(AnswerEvent::Complete(answer)).await;
                return;
            }
            PreparedAnswer::Generate(pending) => pending,
        };

        let generated = match self.generator.generate_stream(&pending.prompt).await {
            Ok(pieces) => forward_pieces(&pending.prompt, pieces, &events).await,
            Err(e) => Err(e),
        };

        let answer = self.finish(pending, generated).await;
        if events.send(AnswerEvent::Complete(answer)).await.is_err() {
            debug!("Stream closed before the answer was complete");
        }
    }

    /// Turn the generator's outcome into the answer and remember the turn
    async fn finish(&self, pending: PendingAnswer, generated: Result<String>) -> ChatAnswer {
        let response = match generated {
            Ok(answer) => {
                if let Some(conversation) = &pending.conversation {
                    let turn = Turn {
                        question: pending.question,
                        answer: answer.clone(),
                    };
                    self.history.record(conversation, turn).await;
                }
                answer
            }
            Err(e) => {
                warn!("Generation with {} failed: {}", self.generator.model(), e);
                APOLOGY_REPLY.to_string()
            }
        };

        ChatAnswer {
            response,
            sources: pending.sources,
        }
    }

    /// Run an interactive question loop on stdin/stdout
    pub async fn run_query_loop(&self) -> anyhow::Result<()> {
        let mut stdout = io::stdout();
        let mut lines = BufReader::new(io::stdin()).lines();

        stdout
            .write_all(b"Ready to answer questions. Type 'clear' to forget the conversation, 'exit' to quit.\n")
            .await?;
        let ask = AskOptions {
            conversation: Some(CLI_CONVERSATION.to_string()),
            style: AnswerStyle::General,
        };

        loop {
            stdout.write_all(b"\nYour question: ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let question = line.trim();

            if question.eq_ignore_ascii_case("exit") {
                break;
            }
            if question.is_empty() {
                continue;
            }
            if question.eq_ignore_ascii_case("clear") {
                self.history.clear(CLI_CONVERSATION).await;
                stdout.write_all(b"Conversation cleared.\n").await?;
                continue;
            }

            match self.answer_with(question, &ask).await {
                Ok(answer) => {
                    let rendered = render_answer(&answer);
                    stdout.write_all(rendered.as_bytes()).await?;
                }
                Err(e) => {
                    let message = format!("\nError: {}\n", e);
                    stdout.write_all(message.as_bytes()).await?;
                }
            }
        }

        stdout.write_all(b"Goodbye!\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Human-readable form of an answer, used by the CLI
pub fn render_answer(answer: &ChatAnswer) -> String {
    let mut out = format!("\n{}\n", answer.response);
    if !answer.sources.is_empty() {
        out.push_str("\nSources:\n");
        for source in &answer.sources {
            out.push_str(&format!(
                "  [{}] {} (page {}): {}\n",
                source.index, source.file, source.page, source.snippet
            ));
        }
    }
    out
}

/// Turn ranked hits into citations
pub fn citations(hits: &[SearchHit], snippet_chars: usize) -> Vec<SourceCitation> {
    hits.iter()
        .enumerate()
        .map(|(idx, hit)| SourceCitation {
            index: idx + 1,
            file: hit.chunk.source.clone(),
            page: hit.chunk.page,
            snippet: snippet(&hit.chunk.text, snippet_chars),
        })
        .collect()
}

/// First `max_chars` characters on one line, with `...` when cut short
fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}

/// Pass streamed pieces on to the client and return the full answer
async fn forward_pieces(
    prompt: &str,
    mut pieces: TokenStream,
    events: &mpsc::Sender<AnswerEvent>,
) -> Result<String> {
    let mut generated = String::new();
    let mut filter = EchoFilter::new(prompt);

    while let Some(piece) = pieces.next().await {
        let piece = piece?;
        generated.push_str(&piece);
        if let Some(text) = filter.push(&piece) {
            if events.send(AnswerEvent::Token(text)).await.is_err() {
                return Err(RagError::Generation(
                    "Client disconnected during streaming".to_string(),
                ));
            }
        }
    }

    extract_answer(&generated)
}

fn join_error(err: tokio::task::JoinError) -> RagError {
    RagError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
}
