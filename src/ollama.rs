use crate::config::string_or;
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::generation::{Generator, TokenStream};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

/// Configuration for a local Ollama server
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub url: String,
    pub embedding_model: String,
    pub generation_model: String,
}

impl OllamaConfig {
    pub fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        OllamaConfig {
            url: string_or(lookup, "OLLAMA_URL", "http://localhost:11434"),
            embedding_model: string_or(lookup, "OLLAMA_EMBEDDING_MODEL", "all-minilm"),
            generation_model: string_or(lookup, "OLLAMA_GENERATION_MODEL", "tinyllama"),
        }
    }
}

/// Client for models hosted by a local Ollama server
#[derive(Debug, Clone)]
pub struct OllamaClient {
    config: OllamaConfig,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: i32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// One line of a streamed `/api/generate` response
#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

impl OllamaClient {
    pub fn new(config: OllamaConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        info!(
            "Using Ollama at {} (embeddings: {}, generation: {})",
            config.url, config.embedding_model, config.generation_model
        );
        Ok(OllamaClient { config, client })
    }

    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Read the server's error message from a failed response
    async fn failure_message(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        format!("Ollama returned {}: {}", status, detail)
    }

    pub async fn get_embedding(&self, text: &str) -> Result<Embedding> {
        let request = EmbedRequest {
            model: &self.config.embedding_model,
            prompt: text,
        };

        let response = self
            .client
            .post(self.endpoint("/api/embeddings"))
            .json(&request)
            .send()
            .await
            .map_err(RagError::embedding)?;

        if !response.status().is_success() {
            return Err(RagError::Embedding(Self::failure_message(response).await));
        }

        let body: EmbedResponse = response.json().await.map_err(RagError::embedding)?;
        if body.embedding.is_empty() {
            return Err(RagError::Embedding(format!(
                "Model {} returned an empty embedding",
                self.config.embedding_model
            )));
        }

        Ok(Embedding::new(body.embedding))
    }

    fn generate_request<'a>(&'a self, prompt: &'a str, stream: bool) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.config.generation_model,
            prompt,
            stream,
            options: GenerateOptions {
                temperature: 0.2,
                num_predict: 512,
            },
        }
    }

    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let request = self.generate_request(prompt, false);

        debug!(
            "Requesting completion from {} ({} prompt characters)",
            self.config.generation_model,
            prompt.len()
        );

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&request)
            .send()
            .await
            .map_err(RagError::generation)?;

        if !response.status().is_success() {
            return Err(RagError::Generation(Self::failure_message(response).await));
        }

        let body: GenerateResponse = response.json().await.map_err(RagError::generation)?;
        Ok(body.response)
    }

    /// Stream the completion as Ollama produces it
    pub async fn stream_text(&self, prompt: &str) -> Result<TokenStream> {
        let request = self.generate_request(prompt, true);
        debug!(
            "Requesting streamed completion from {}",
            self.config.generation_model
        );

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&request)
            .send()
            .await
            .map_err(RagError::generation)?;

        if !response.status().is_success() {
            return Err(RagError::Generation(Self::failure_message(response).await));
        }

        Ok(stream_lines(response.bytes_stream()).boxed())
    }
}

struct LineReader<S> {
    bytes: Pin<Box<S>>,
    buffer: Vec<u8>,
    ready: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> LineReader<S> {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.parse_line(&line);
            if self.finished {
                self.buffer.clear();
                return;
            }
        }
    }

    fn parse_line(&mut self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match serde_json::from_slice::<StreamLine>(line) {
            Ok(StreamLine {
                error: Some(error), ..
            }) => self.fail(RagError::Generation(format!("Ollama stream failed: {}", error))),
            Ok(line) => {
                if !line.response.is_empty() {
                    self.ready.push_back(Ok(line.response));
                }
                self.finished = line.done;
            }
            Err(e) => self.fail(RagError::Generation(format!("Malformed stream line: {}", e))),
        }
    }

    fn fail(&mut self, err: RagError) {
        self.ready.push_back(Err(err));
        self.finished = true;
    }
}

/// Turn Ollama's newline-delimited JSON into answer pieces. Lines may be
/// split across network chunks.
fn stream_lines<S, B>(bytes: S) -> impl Stream<Item = Result<String>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let reader = LineReader {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(piece) = reader.ready.pop_front() {
                return Some((piece, reader));
            }
            if reader.finished {
                return None;
            }

            match reader.bytes.next().await {
                Some(Ok(chunk)) => {
                    reader.buffer.extend_from_slice(chunk.as_ref());
                    reader.drain_lines();
                }
                Some(Err(e)) => reader.fail(RagError::generation(e)),
                None => {
                    let rest = std::mem::take(&mut reader.buffer);
                    reader.parse_line(&rest);
                    reader.finished = true;
                }
            }
        }
    })
}

#[async_trait]
impl Embedder for OllamaClient {
    fn model(&self) -> &str {
        &self.config.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.get_embedding(text).await
    }
}

#[async_trait]
impl Generator for OllamaClient {
    fn model(&self) -> &str {
        &self.config.generation_model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_text(prompt).await
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        self.stream_text(prompt).await
    }
}
