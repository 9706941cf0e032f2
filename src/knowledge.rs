//! Similarity lookup over the curated knowledge store.
//!
//! Retrieval is secondary validation context for the reasoning agents: the
//! agents analyze from persona traits first and cite matching heuristics
//! literature second. Chunks without embeddings are skipped rather than
//! embedded on the fly.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::KnowledgeConfig;
use crate::error::Result;
use crate::llm::ChatModel;
use crate::model::{Citation, KnowledgeChunk};

/// Excerpt length cap per citation.
const EXCERPT_LEN: usize = 200;

pub struct KnowledgeStore {
    chunks: Vec<KnowledgeChunk>,
    model: Arc<dyn ChatModel>,
    similarity_threshold: f32,
    top_k: usize,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

impl KnowledgeStore {
    pub fn new(
        chunks: Vec<KnowledgeChunk>,
        model: Arc<dyn ChatModel>,
        config: &KnowledgeConfig,
    ) -> Self {
        Self {
            chunks,
            model,
            similarity_threshold: config.similarity_threshold,
            top_k: config.top_k,
        }
    }

    /// Top-k chunks above the similarity threshold, optionally narrowed to a
    /// category, returned as citations. An embedding failure degrades to an
    /// empty citation list so retrieval never blocks analysis.
    pub async fn retrieve(&self, query: &str, category: Option<&str>) -> Vec<Citation> {
        let query_embedding = match self.model.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "query embedding failed, skipping retrieval");
                return vec![];
            }
        };

        let mut scored: Vec<(f32, &KnowledgeChunk)> = self
            .chunks
            .iter()
            .filter(|chunk| category.map(|c| chunk.category == c).unwrap_or(true))
            .filter_map(|chunk| {
                chunk.embedding.as_ref().map(|embedding| {
                    (cosine_similarity(&query_embedding, embedding), chunk)
                })
            })
            .filter(|(score, _)| *score >= self.similarity_threshold)
            .collect();

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.top_k);

        info!(query_len = query.len(), matches = scored.len(), "knowledge retrieval");

        scored
            .into_iter()
            .map(|(_, chunk)| Citation {
                source: chunk.source.clone(),
                title: chunk.title.clone(),
                excerpt: chunk.content.chars().take(EXCERPT_LEN).collect(),
            })
            .collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}
