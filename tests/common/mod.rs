//! Deterministic stand-ins for the model backends, plus PDF fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use papermind::chunking::ChunkingConfig;
use papermind::config::IndexMode;
use papermind::embeddings::{Embedder, Embedding};
use papermind::error::{RagError, Result};
use papermind::generation::{Generator, INSUFFICIENT_CONTEXT_REPLY};
use papermind::rag::{EngineOptions, RagEngine};
use papermind::vector_store::IndexStore;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "does", "for", "from", "how", "in", "is",
    "it", "of", "on", "or", "the", "to", "was", "what", "when", "where", "which", "who", "why",
];

/// Lowercased content words of `text`
pub fn content_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Bag-of-words embedder: each content word bumps one hashed dimension
pub struct HashEmbedder {
    dims: usize,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        HashEmbedder {
            dims,
            calls: AtomicUsize::new(0),
        }
    }
}

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf29ce484222325, |hash, byte| {
        (hash ^ byte as u64).wrapping_mul(0x100000001b3)
    })
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        "hash-bow"
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut values = vec![0.0f32; self.dims];
        for word in content_words(text) {
            values[(fnv1a(&word) % self.dims as u64) as usize] += 1.0;
        }
        Ok(Embedding::new(values))
    }
}

/// Embedder that always fails
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model(&self) -> &str {
        "broken"
    }

    async fn embed(&self, _text: &str) -> Result<Embedding> {
        Err(RagError::Embedding("embedding service unavailable".to_string()))
    }
}

/// Generator that answers like an obedient local model: it echoes the
/// prompt, then quotes the context sentence sharing the most content words
/// with the question, or the insufficient-context reply when none does.
#[derive(Default)]
pub struct ContextQuotingGenerator {
    pub calls: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
}

impl ContextQuotingGenerator {
    pub fn last_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("generator was never called")
    }
}

fn section<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let after = prompt.split_once(start).map(|(_, rest)| rest).unwrap_or("");
    after.split_once(end).map(|(body, _)| body).unwrap_or(after)
}

#[async_trait]
impl Generator for ContextQuotingGenerator {
    fn model(&self) -> &str {
        "quoting"
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        assert!(
            prompt.contains(INSUFFICIENT_CONTEXT_REPLY),
            "prompt lacks the insufficient-context instruction"
        );

        let context = section(prompt, "### Context:\n", "\n\n### Question:");
        let question = section(prompt, "### Question:\n", "\n\n### Answer:");
        let wanted: HashSet<String> = content_words(question).into_iter().collect();

        let best = context
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                let overlap = content_words(s)
                    .into_iter()
                    .filter(|w| wanted.contains(w))
                    .count();
                (overlap, s)
            })
            .fold(None, |best: Option<(usize, &str)>, candidate| match best {
                Some(b) if b.0 >= candidate.0 => Some(b),
                _ => Some(candidate),
            });

        let answer = match best {
            Some((overlap, sentence)) if overlap > 0 => format!("{}.", sentence),
            _ => INSUFFICIENT_CONTEXT_REPLY.to_string(),
        };
        Ok(format!("{} {}", prompt, answer))
    }
}

/// Generator that always fails
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    fn model(&self) -> &str {
        "offline"
    }

    async fn generate(&self, _prompt: &str) -> Result<String> {
        Err(RagError::Generation("model offline".to_string()))
    }
}

pub fn options(index_mode: IndexMode) -> EngineOptions {
    EngineOptions {
        chunking: ChunkingConfig {
            chunk_size: 200,
            chunk_overlap: 20,
        },
        top_k: NonZeroUsize::new(3).unwrap(),
        snippet_chars: 150,
        index_mode,
        history_turns: 10,
    }
}

/// Engine with the deterministic test backends
pub async fn test_engine(index_dir: &Path, index_mode: IndexMode) -> Arc<RagEngine> {
    engine_with(
        index_dir,
        index_mode,
        Arc::new(HashEmbedder::new(256)),
        Arc::new(ContextQuotingGenerator::default()),
    )
    .await
}

pub async fn engine_with(
    index_dir: &Path,
    index_mode: IndexMode,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
) -> Arc<RagEngine> {
    let store = IndexStore::open(index_dir)
        .await
        .expect("store should open");
    let engine = RagEngine::open(embedder, generator, store, options(index_mode))
        .await
        .expect("engine should open");
    Arc::new(engine)
}

/// Render a PDF with one line of Helvetica text per page
pub fn pdf_bytes(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("content should encode"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let pages_dict = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => pages.len() as i64,
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages_dict));
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("pdf should serialize");
    bytes
}

pub fn write_pdf(path: &Path, pages: &[&str]) {
    std::fs::write(path, pdf_bytes(pages)).expect("pdf should be written");
}

pub const FRANCE_PAGES: &[&str] = &[
    "The capital of France is Paris.",
    "Bananas are rich in potassium and grow in tropical climates.",
];

pub const RIVERS_PAGES: &[&str] = &["The Danube flows through Vienna and Budapest."];
