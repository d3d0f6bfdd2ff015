use crate::chunking::ChunkingConfig;
use crate::gemini::GeminiConfig;
use crate::ollama::OllamaConfig;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// What happens to the existing index when a new document is ingested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexMode {
    /// Keep other documents; chunks of a re-ingested file are replaced
    #[default]
    Merge,
    /// The new document becomes the whole index
    Replace,
}

impl FromStr for IndexMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" => Ok(IndexMode::Merge),
            "replace" => Ok(IndexMode::Replace),
            other => bail!("Unknown index mode '{}', expected 'merge' or 'replace'", other),
        }
    }
}

/// Which model backend serves embeddings and generation
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Models served locally by Ollama
    Ollama(OllamaConfig),
    /// Hosted Gemini API
    Gemini(GeminiConfig),
}

/// Process configuration, read once at startup
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub upload_dir: PathBuf,
    pub index_path: PathBuf,
    pub static_dir: PathBuf,
    pub index_mode: IndexMode,
    pub chunking: ChunkingConfig,
    pub top_k: NonZeroUsize,
    pub snippet_chars: usize,
    /// Question/answer pairs remembered per conversation
    pub history_turns: usize,
    pub max_upload_bytes: usize,
    pub request_timeout: Duration,
    pub backend: BackendConfig,
}

impl Settings {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chunking = ChunkingConfig {
            chunk_size: parse_or(&lookup, "RAG_CHUNK_SIZE", 1000)?,
            chunk_overlap: parse_or(&lookup, "RAG_CHUNK_OVERLAP", 150)?,
        };
        if chunking.chunk_size == 0 {
            bail!("RAG_CHUNK_SIZE must be greater than zero");
        }
        if chunking.chunk_overlap >= chunking.chunk_size {
            bail!(
                "RAG_CHUNK_OVERLAP ({}) must be smaller than RAG_CHUNK_SIZE ({})",
                chunking.chunk_overlap,
                chunking.chunk_size
            );
        }

        let top_k: usize = parse_or(&lookup, "RAG_TOP_K", 3)?;
        let top_k = NonZeroUsize::new(top_k).context("RAG_TOP_K must be a positive integer")?;

        let backend = match lookup("RAG_BACKEND")
            .unwrap_or_else(|| "ollama".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "ollama" => BackendConfig::Ollama(OllamaConfig::from_lookup(&lookup)),
            "gemini" => BackendConfig::Gemini(
                GeminiConfig::from_lookup(&lookup).context("Missing GEMINI_API_KEY")?,
            ),
            other => bail!("Unknown RAG_BACKEND '{}', expected 'ollama' or 'gemini'", other),
        };

        Ok(Settings {
            bind_addr: string_or(&lookup, "RAG_BIND_ADDR", "127.0.0.1:8000"),
            upload_dir: string_or(&lookup, "RAG_UPLOAD_DIR", "uploads").into(),
            index_path: string_or(&lookup, "RAG_INDEX_PATH", "vectorstore").into(),
            static_dir: string_or(&lookup, "RAG_STATIC_DIR", "static").into(),
            index_mode: parse_or(&lookup, "RAG_INDEX_MODE", IndexMode::Merge)?,
            chunking,
            top_k,
            snippet_chars: parse_or(&lookup, "RAG_SNIPPET_CHARS", 150)?,
            history_turns: parse_or(&lookup, "RAG_HISTORY_TURNS", 10)?,
            max_upload_bytes: parse_or(&lookup, "RAG_MAX_UPLOAD_BYTES", 10 * 1024 * 1024)?,
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "RAG_REQUEST_TIMEOUT_SECS",
                120,
            )?),
            backend,
        })
    }
}

/// Value of `key`, or `default` when unset or blank
pub(crate) fn string_or<F>(lookup: &F, key: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key).map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => value
            .parse()
            .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", value, key, e)),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(settings.bind_addr, "127.0.0.1:8000");
        assert_eq!(settings.upload_dir, PathBuf::from("uploads"));
        assert_eq!(settings.index_path, PathBuf::from("vectorstore"));
        assert_eq!(settings.index_mode, IndexMode::Merge);
        assert_eq!(settings.chunking, ChunkingConfig::default());
        assert_eq!(settings.top_k.get(), 3);
        assert_eq!(settings.snippet_chars, 150);
        assert_eq!(settings.history_turns, 10);
        assert_eq!(settings.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.request_timeout, Duration::from_secs(120));
        assert!(matches!(settings.backend, BackendConfig::Ollama(_)));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("RAG_INDEX_MODE", "Replace"),
            ("RAG_CHUNK_SIZE", "500"),
            ("RAG_CHUNK_OVERLAP", "50"),
            ("RAG_TOP_K", "5"),
            ("RAG_HISTORY_TURNS", "0"),
            ("RAG_BACKEND", "gemini"),
            ("GEMINI_API_KEY", "secret"),
            ("GEMINI_GENERATION_MODEL", "gemini-test"),
        ]))
        .unwrap();

        assert_eq!(settings.index_mode, IndexMode::Replace);
        assert_eq!(settings.chunking.chunk_size, 500);
        assert_eq!(settings.chunking.chunk_overlap, 50);
        assert_eq!(settings.top_k.get(), 5);
        assert_eq!(settings.history_turns, 0);
        match settings.backend {
            BackendConfig::Gemini(gemini) => {
                assert_eq!(gemini.api_key, "secret");
                assert_eq!(gemini.generation_model, "gemini-test");
            }
            other => panic!("expected gemini backend, got {:?}", other),
        }
    }

    #[test]
    fn test_gemini_requires_api_key() {
        let result = Settings::from_lookup(lookup_from(&[("RAG_BACKEND", "gemini")]));
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Settings::from_lookup(lookup_from(&[("RAG_TOP_K", "0")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("RAG_TOP_K", "many")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("RAG_INDEX_MODE", "append")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("RAG_BACKEND", "openai")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[
            ("RAG_CHUNK_SIZE", "100"),
            ("RAG_CHUNK_OVERLAP", "100"),
        ]))
        .is_err());
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() {
        let settings =
            Settings::from_lookup(lookup_from(&[("RAG_TOP_K", " "), ("RAG_UPLOAD_DIR", "")]))
                .unwrap();
        assert_eq!(settings.top_k.get(), 3);
        assert_eq!(settings.upload_dir, PathBuf::from("uploads"));
    }
}
