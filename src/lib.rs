pub mod chunking;
pub mod config;
pub mod document;
pub mod embeddings;
pub mod error;
pub mod gemini;
pub mod generation;
pub mod history;
pub mod ollama;
pub mod rag;
pub mod server;
pub mod vector_store;
