use crate::chunking::Chunk;
use crate::embeddings::{Embedder, Embedding};
use crate::error::{RagError, Result};
use arrow::array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, RecordBatchIterator, StringArray,
    UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use lancedb::database::CreateTableMode;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::table::OptimizeAction;
use lancedb::{Connection, DistanceType, Table};
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TABLE_NAME: &str = "chunks";
const MODEL_KEY: &str = "papermind.embedding_model";

const SEQ: &str = "seq";
const VECTOR: &str = "vector";
const TEXT: &str = "text";
const SOURCE: &str = "source";
const PAGE: &str = "page";
const DISTANCE: &str = "_distance";

/// A chunk together with its vector
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Embedding,
}

/// A search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: Chunk,
    /// Cosine similarity to the query; higher is closer
    pub score: f32,
}

/// Chunk embeddings in insertion order, before they are written to the store.
///
/// Insertion order is persisted with every entry and breaks ties between
/// equal search scores.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    model: String,
    dimension: usize,
    entries: Vec<IndexEntry>,
}

impl VectorIndex {
    pub fn empty(model: impl Into<String>) -> Self {
        VectorIndex {
            model: model.into(),
            dimension: 0,
            entries: Vec::new(),
        }
    }

    /// Assemble an index, checking that every vector has the same dimension
    pub fn from_entries(model: impl Into<String>, entries: Vec<IndexEntry>) -> Result<Self> {
        let dimension = entries.first().map(|e| e.embedding.dimension()).unwrap_or(0);
        if let Some(bad) = entries
            .iter()
            .find(|e| e.embedding.dimension() != dimension)
        {
            return Err(RagError::Embedding(format!(
                "Inconsistent embedding dimensions: expected {}, got {}",
                dimension,
                bad.embedding.dimension()
            )));
        }

        Ok(VectorIndex {
            model: model.into(),
            dimension,
            entries,
        })
    }

    /// Embed `chunks` in order and index them
    pub async fn build(chunks: Vec<Chunk>, embedder: &dyn Embedder) -> Result<Self> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;

        if embeddings.len() != chunks.len() {
            return Err(RagError::Embedding(format!(
                "Expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            )));
        }

        let entries = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry { chunk, embedding })
            .collect();

        Self::from_entries(embedder.model(), entries)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Distinct source file names, in first-seen order
    pub fn sources(&self) -> Vec<&str> {
        first_seen(self.entries.iter().map(|e| e.chunk.source.as_str()))
    }

    /// Combine with a newer index.
    ///
    /// Entries of any file present in `newer` are dropped from `self` first,
    /// so re-ingesting a file replaces its chunks instead of duplicating
    /// them. The newer entries are appended after the survivors.
    pub fn merge(self, newer: VectorIndex) -> Result<Self> {
        if newer.is_empty() {
            return Ok(self);
        }

        let replaced: HashSet<String> = newer
            .entries
            .iter()
            .map(|e| e.chunk.source.clone())
            .collect();

        let mut entries: Vec<IndexEntry> = self
            .entries
            .into_iter()
            .filter(|e| !replaced.contains(&e.chunk.source))
            .collect();

        if self.model != newer.model && !entries.is_empty() {
            warn!(
                "Merging entries embedded with '{}' into an index built with '{}'",
                newer.model, self.model
            );
        }

        entries.extend(newer.entries);
        Self::from_entries(newer.model, entries)
    }
}

/// One committed version of the `chunks` table.
///
/// The table handle is checked out at the version it was opened with, so a
/// snapshot keeps answering from the same rows while later saves commit
/// newer versions.
pub struct IndexSnapshot {
    table: Table,
    version: u64,
    model: String,
    dimension: usize,
    len: usize,
    sources: Vec<String>,
}

impl fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("version", &self.version)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("len", &self.len)
            .finish()
    }
}

impl IndexSnapshot {
    async fn pin(table: Table) -> Result<Self> {
        let version = table.version().await.map_err(RagError::store)?;
        table.checkout(version).await.map_err(RagError::store)?;

        let schema = table.schema().await.map_err(RagError::store)?;
        let dimension = vector_dimension(&schema)?;
        let model = match schema.metadata().get(MODEL_KEY) {
            Some(model) => model.clone(),
            None => {
                warn!("Vector store does not record its embedding model");
                String::new()
            }
        };

        let batches = scan(&table, &[SEQ, SOURCE]).await?;
        let mut rows: Vec<(u32, String)> = Vec::new();
        for batch in &batches {
            let seqs = column::<UInt32Array>(batch, SEQ)?;
            let sources = column::<StringArray>(batch, SOURCE)?;
            for row in 0..batch.num_rows() {
                rows.push((seqs.value(row), sources.value(row).to_string()));
            }
        }
        rows.sort_by_key(|(seq, _)| *seq);

        let sources = first_seen(rows.iter().map(|(_, source)| source.as_str()))
            .into_iter()
            .map(str::to_string)
            .collect();

        Ok(IndexSnapshot {
            table,
            version,
            model,
            dimension,
            len: rows.len(),
            sources,
        })
    }

    /// Table version this snapshot reads from
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distinct source file names, in first-seen order
    pub fn sources(&self) -> Vec<&str> {
        self.sources.iter().map(String::as_str).collect()
    }

    /// The `k` entries most similar to `query`, best first.
    ///
    /// Returns every entry when the snapshot holds fewer than `k`. The search
    /// is exact. Equal scores are ordered by insertion, except that which of
    /// several equal entries make the cut at the `k`-th place is up to lancedb.
    pub async fn search(&self, query: &Embedding, k: NonZeroUsize) -> Result<Vec<SearchHit>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        if query.dimension() != self.dimension {
            return Err(RagError::Embedding(format!(
                "Query has dimension {} but the index has dimension {}",
                query.dimension(),
                self.dimension
            )));
        }

        let results = self
            .table
            .vector_search(query.values.as_slice())
            .map_err(RagError::store)?
            .column(VECTOR)
            .distance_type(DistanceType::Cosine)
            .bypass_vector_index()
            .select(Select::columns(&[SEQ, TEXT, SOURCE, PAGE]))
            .limit(k.get())
            .execute()
            .await
            .map_err(RagError::store)?;
        let batches: Vec<RecordBatch> = results.try_collect().await.map_err(RagError::store)?;

        let mut scored = Vec::new();
        for batch in &batches {
            let seqs = column::<UInt32Array>(batch, SEQ)?;
            let distances = column::<Float32Array>(batch, DISTANCE)?;
            for (row, chunk) in read_chunks(batch)?.into_iter().enumerate() {
                let score = similarity(distances.value(row));
                scored.push((seqs.value(row), SearchHit { chunk, score }));
            }
        }

        debug!("Vector search returned {} rows", scored.len());
        Ok(rank(scored, k))
    }

    /// Read every entry back, in insertion order
    pub async fn to_index(&self) -> Result<VectorIndex> {
        let batches = scan(&self.table, &[SEQ, VECTOR, TEXT, SOURCE, PAGE]).await?;

        let mut rows: Vec<(u32, IndexEntry)> = Vec::with_capacity(self.len);
        for batch in &batches {
            let seqs = column::<UInt32Array>(batch, SEQ)?;
            let vectors = column::<FixedSizeListArray>(batch, VECTOR)?;
            for (row, chunk) in read_chunks(batch)?.into_iter().enumerate() {
                let values = vectors.value(row);
                let values = values
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| RagError::Store("Vector column is not Float32".to_string()))?;
                let embedding = Embedding::new(values.values().to_vec());
                rows.push((seqs.value(row), IndexEntry { chunk, embedding }));
            }
        }
        rows.sort_by_key(|(seq, _)| *seq);

        VectorIndex::from_entries(
            self.model.clone(),
            rows.into_iter().map(|(_, entry)| entry).collect(),
        )
    }
}

/// The lancedb database holding the index.
///
/// All chunks live in one `chunks` table. A save rewrites the table in a
/// single commit, so readers see either the previous version or the new
/// one, never a mix.
#[derive(Clone)]
pub struct IndexStore {
    root: PathBuf,
    connection: Connection,
}

impl fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexStore").field("root", &self.root).finish()
    }
}

impl IndexStore {
    /// Connect to the database under `root`, creating the folder if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let absolute = tokio::fs::canonicalize(&root).await?;

        let uri = format!("file://{}", absolute.display());
        debug!("Connecting to vector store at {}", uri);
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(RagError::store)?;

        Ok(IndexStore { root, connection })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether an index has been saved
    pub async fn exists(&self) -> Result<bool> {
        let tables = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(RagError::store)?;
        Ok(tables.iter().any(|name| name == TABLE_NAME))
    }

    /// Replace the stored index with `index` and return the new snapshot
    pub async fn save(&self, index: &VectorIndex) -> Result<IndexSnapshot> {
        if index.is_empty() {
            return Err(RagError::Store(
                "Refusing to save an index with no entries".to_string(),
            ));
        }

        let batch = record_batch(index)?;
        let schema = batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(batch)), schema);

        let table = self
            .connection
            .create_table(TABLE_NAME, reader)
            .mode(CreateTableMode::Overwrite)
            .execute()
            .await
            .map_err(RagError::store)?;

        if let Err(e) = table.optimize(OptimizeAction::All).await {
            warn!("Could not compact the vector store: {}", e);
        }

        let snapshot = IndexSnapshot::pin(table).await?;
        info!(
            "Saved vector index version {} ({} entries) to {}",
            snapshot.version(),
            snapshot.len(),
            self.root.display()
        );
        Ok(snapshot)
    }

    /// Open the latest saved version
    pub async fn load(&self) -> Result<IndexSnapshot> {
        if !self.exists().await? {
            return Err(RagError::IndexNotFound(self.root.display().to_string()));
        }

        let table = self
            .connection
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(RagError::store)?;
        let snapshot = IndexSnapshot::pin(table).await?;

        debug!(
            "Loaded vector index version {} with {} entries",
            snapshot.version(),
            snapshot.len()
        );
        Ok(snapshot)
    }
}

fn table_schema(model: &str, dimension: i32) -> SchemaRef {
    let metadata = HashMap::from([(MODEL_KEY.to_string(), model.to_string())]);
    Arc::new(Schema::new_with_metadata(
        vec![
            Field::new(SEQ, DataType::UInt32, false),
            Field::new(
                VECTOR,
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    dimension,
                ),
                false,
            ),
            Field::new(TEXT, DataType::Utf8, false),
            Field::new(SOURCE, DataType::Utf8, false),
            Field::new(PAGE, DataType::UInt32, false),
        ],
        metadata,
    ))
}

fn record_batch(index: &VectorIndex) -> Result<RecordBatch> {
    let dimension = i32::try_from(index.dimension())
        .map_err(|_| RagError::Store(format!("Dimension {} is too large", index.dimension())))?;
    let too_many = |_| RagError::Store("Too many entries for one index".to_string());

    let entries = index.entries();
    let mut seqs = Vec::with_capacity(entries.len());
    let mut flat_values = Vec::with_capacity(entries.len() * index.dimension());
    let mut texts = Vec::with_capacity(entries.len());
    let mut sources = Vec::with_capacity(entries.len());
    let mut pages = Vec::with_capacity(entries.len());

    for (idx, entry) in entries.iter().enumerate() {
        seqs.push(u32::try_from(idx).map_err(too_many)?);
        flat_values.extend_from_slice(&entry.embedding.values);
        texts.push(entry.chunk.text.as_str());
        sources.push(entry.chunk.source.as_str());
        pages.push(u32::try_from(entry.chunk.page).map_err(too_many)?);
    }

    let item = Arc::new(Field::new("item", DataType::Float32, false));
    let vectors =
        FixedSizeListArray::try_new(item, dimension, Arc::new(Float32Array::from(flat_values)), None)
            .map_err(|e| RagError::Store(format!("Failed to build vector column: {}", e)))?;

    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from(seqs)),
        Arc::new(vectors),
        Arc::new(StringArray::from(texts)),
        Arc::new(StringArray::from(sources)),
        Arc::new(UInt32Array::from(pages)),
    ];

    RecordBatch::try_new(table_schema(index.model(), dimension), columns)
        .map_err(|e| RagError::Store(format!("Failed to build record batch: {}", e)))
}

fn vector_dimension(schema: &Schema) -> Result<usize> {
    match schema.field_with_name(VECTOR).map(|field| field.data_type()) {
        Ok(DataType::FixedSizeList(_, size)) => usize::try_from(*size)
            .map_err(|_| RagError::Store(format!("Invalid vector dimension {}", size))),
        _ => Err(RagError::Store(
            "Table has no fixed-size vector column".to_string(),
        )),
    }
}

async fn scan(table: &Table, columns: &[&str]) -> Result<Vec<RecordBatch>> {
    let results = table
        .query()
        .select(Select::columns(columns))
        .execute()
        .await
        .map_err(RagError::store)?;
    results.try_collect().await.map_err(RagError::store)
}

fn column<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<T>())
        .ok_or_else(|| RagError::Store(format!("Missing or mistyped column '{}'", name)))
}

fn read_chunks(batch: &RecordBatch) -> Result<Vec<Chunk>> {
    let texts = column::<StringArray>(batch, TEXT)?;
    let sources = column::<StringArray>(batch, SOURCE)?;
    let pages = column::<UInt32Array>(batch, PAGE)?;

    Ok((0..batch.num_rows())
        .map(|row| Chunk {
            text: texts.value(row).to_string(),
            source: sources.value(row).to_string(),
            page: pages.value(row) as usize,
        })
        .collect())
}

/// Cosine similarity from lancedb's cosine distance; zero-length vectors score 0
fn similarity(distance: f32) -> f32 {
    let score = 1.0 - distance;
    if score.is_nan() {
        0.0
    } else {
        score
    }
}

/// Best first, insertion order among equal scores
fn rank(mut scored: Vec<(u32, SearchHit)>, k: NonZeroUsize) -> Vec<SearchHit> {
    scored.sort_by(|(seq_a, a), (seq_b, b)| {
        b.score.total_cmp(&a.score).then(seq_a.cmp(seq_b))
    });
    scored
        .into_iter()
        .take(k.get())
        .map(|(_, hit)| hit)
        .collect()
}

fn first_seen<'a>(sources: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    sources.filter(|source| seen.insert(*source)).collect()
}
