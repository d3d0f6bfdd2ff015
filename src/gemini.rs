use crate::config::string_or;
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use crate::generation::Generator;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Configuration for Gemini API
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub embedding_model: String,
    pub generation_model: String,
}

impl GeminiConfig {
    /// Read the configuration through `lookup`; only the API key is required
    pub fn from_lookup<F>(lookup: &F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY is not set"))?;

        Ok(GeminiConfig {
            api_key,
            base_url: string_or(lookup, "GEMINI_BASE_URL", DEFAULT_BASE_URL),
            embedding_model: string_or(lookup, "GEMINI_EMBEDDING_MODEL", "text-embedding-004"),
            generation_model: string_or(lookup, "GEMINI_GENERATION_MODEL", "gemini-1.5-flash"),
        })
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("embedding_model", &self.embedding_model)
            .field("generation_model", &self.generation_model)
            .finish()
    }
}

/// Client for interacting with Gemini API
#[derive(Clone)]
pub struct GeminiClient {
    config: GeminiConfig,
    client: reqwest::Client,
}

impl GeminiClient {
    /// Create a new Gemini client whose requests give up after `timeout`
    pub fn new(config: GeminiConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(GeminiClient { config, client })
    }

    /// Get the client configuration
    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!(
            "{}/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            model,
            method
        )
    }

    /// Generate embeddings for a text
    pub async fn get_embedding(&self, text: &str) -> Result<Embedding> {
        let request = EmbeddingRequest {
            model: format!("models/{}", self.config.embedding_model),
            content: Content {
                parts: vec![Part { text }],
                role: None,
            },
        };

        let url = self.model_url(&self.config.embedding_model, "embedContent");
        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.config.api_key)])
            .json(&request)
            .send()
            .await
            .map_err(RagError::embedding)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::Embedding(format!(
                "API request failed: {} {}",
                status, error_text
            )));
        }

        let response_data: EmbeddingResponse =
            response.json().await.map_err(RagError::embedding)?;

        if response_data.embedding.values.is_empty() {
            return Err(RagError::Embedding("API returned an empty embedding".to_string()));
        }

        Ok(Embedding::new(response_data.embedding.values))
    }

    /// Generate text using the configured Gemini model
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
                role: Some("user"),
            }],
            generation_config: GenerationConfig {
                temperature: 0.2,
                top_p: 0.8,
                top_k: 40,
                max_output_tokens: 1024,
            },
        };

        let url = self.model_url(&self.config.generation_model, "generateContent");
        debug!("Requesting completion from {}", self.config.generation_model);

        let response = self
            .client
            .post(&url)
            .query(&[("key", &self.config.api_key)])
            .json(&request)
            .send()
            .await
            .map_err(RagError::generation)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RagError::Generation(format!(
                "API request failed: {} {}",
                status, error_text
            )));
        }

        let response_data: GenerateResponse =
            response.json().await.map_err(RagError::generation)?;

        // Concatenate the parts of the first candidate
        response_data
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| RagError::Generation("No response generated".to_string()))
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    fn model(&self) -> &str {
        &self.config.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.get_embedding(text).await
    }
}

#[async_trait]
impl Generator for GeminiClient {
    fn model(&self) -> &str {
        &self.config.generation_model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_text(prompt).await
    }
}

// Request/response structures for the Gemini API

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: String,
    content: Content<'a>,
}

#[derive(Deserialize, Debug)]
struct EmbeddingResponse {
    embedding: EmbeddingData,
}

#[derive(Deserialize, Debug)]
struct EmbeddingData {
    values: Vec<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: i32,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: ResponseContent,
}

#[derive(Deserialize, Debug)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}
