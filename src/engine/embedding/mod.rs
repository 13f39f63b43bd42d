// Lorekeep Runtime — Embedding Client
//
// Calls Ollama or OpenAI-compatible embedding APIs to produce vector
// representations of KB chunks and queries. Vectors are L2-normalized
// before they leave this module so similarity is a plain dot product.
//
// Module layout:
//   mod.rs     — EmbeddingClient (HTTP, normalization, batching, fingerprint)
//   manager.rs — per-domain job coalescing with dirty-flag rerun + abort
//   indexer.rs — chunk sync + stale enumeration + batch embed + upsert

pub mod indexer;
pub mod manager;

pub use manager::EmbeddingManager;

use crate::atoms::error::EngineResult;
use log::info;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Provider batch limits. Batches are split on whichever cap hits first.
const MAX_BATCH_ITEMS: usize = 64;
const MAX_BATCH_CHARS: usize = 100_000;

pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    model: String,
    /// Opaque version component of the fingerprint, refreshed when the
    /// backend reports one (digest, revision). Defaults to "0".
    version: String,
}

impl EmbeddingClient {
    pub fn new(base_url: &str, model: &str) -> Self {
        EmbeddingClient {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            version: "0".into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    /// `"<vendor>:<model>:<opaque-version>"` — a silent model swap on the
    /// backend shows up as a fingerprint change and invalidates embeddings.
    pub fn fingerprint(&self) -> String {
        let vendor = if self.base_url.contains("openai.com") { "openai" } else { "ollama" };
        format!("{}:{}:{}", vendor, self.model, self.version)
    }

    /// Embed one text. Tries the Ollama format first, then the
    /// OpenAI-compatible endpoint.
    pub async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        match self.embed_batch(&[text.to_string()]).await {
            Ok(mut vecs) if !vecs.is_empty() => Ok(vecs.remove(0)),
            Ok(_) => Err("empty embedding response".into()),
            Err(e) => Err(e),
        }
    }

    /// Embed a batch of texts, splitting on the provider's item and
    /// character caps. Output order matches input order.
    pub async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in split_batches(texts, MAX_BATCH_ITEMS, MAX_BATCH_CHARS) {
            let vecs = match self.embed_batch_ollama(batch).await {
                Ok(v) => v,
                Err(ollama_err) => self.embed_batch_openai(batch).await.map_err(|openai_err| {
                    format!("Embedding failed. Ollama: {ollama_err} | OpenAI: {openai_err}")
                })?,
            };
            if vecs.len() != batch.len() {
                return Err(format!(
                    "embedding count mismatch: sent {}, got {}",
                    batch.len(),
                    vecs.len()
                )
                .into());
            }
            out.extend(vecs.into_iter().map(|v| l2_normalize(v)));
        }
        Ok(out)
    }

    /// Ollama API: POST /api/embed { model, input: [...] } → { embeddings: [[f32]] }
    async fn embed_batch_ollama(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }))
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .map_err(|e| format!("Ollama not reachable at {} — {}", self.base_url, e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("Ollama embed {status} — {body}").into());
        }

        let v: Value = resp.json().await?;
        let embeddings = v["embeddings"]
            .as_array()
            .ok_or_else(|| "No 'embeddings' array in Ollama response".to_string())?;
        parse_vector_array(embeddings)
    }

    /// OpenAI-compatible: POST /v1/embeddings { model, input: [...] }
    async fn embed_batch_openai(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "input": texts }))
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(format!("OpenAI embed {status} — {body}").into());
        }

        let v: Value = resp.json().await?;
        let data = v["data"]
            .as_array()
            .ok_or_else(|| "No 'data' array in OpenAI response".to_string())?;
        let vectors: Vec<&Value> = data.iter().map(|d| &d["embedding"]).collect();
        let mut out = Vec::with_capacity(vectors.len());
        for vec in vectors {
            let arr = vec
                .as_array()
                .ok_or_else(|| "No 'embedding' array in OpenAI item".to_string())?;
            out.push(
                arr.iter()
                    .filter_map(|x| x.as_f64().map(|f| f as f32))
                    .collect::<Vec<f32>>(),
            );
        }
        Ok(out)
    }

    /// Check the embedding service is reachable and the model answers.
    pub async fn test_connection(&self) -> EngineResult<usize> {
        let vec = self.embed("test connection").await?;
        info!("[embedding] Connection OK — {} dims from '{}'", vec.len(), self.model);
        Ok(vec.len())
    }
}

fn parse_vector_array(values: &[Value]) -> EngineResult<Vec<Vec<f32>>> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        let arr = value
            .as_array()
            .ok_or_else(|| "embedding item is not an array".to_string())?;
        let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
        if vec.is_empty() {
            return Err("empty embedding vector".into());
        }
        out.push(vec);
    }
    Ok(out)
}

/// Split into contiguous batches under both the item and character caps.
/// A single oversized text still goes out alone.
fn split_batches(texts: &[String], max_items: usize, max_chars: usize) -> Vec<&[String]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut chars = 0usize;
    for (i, text) in texts.iter().enumerate() {
        let len = text.len();
        if i > start && (i - start >= max_items || chars + len > max_chars) {
            batches.push(&texts[start..i]);
            start = i;
            chars = 0;
        }
        chars += len;
    }
    if start < texts.len() {
        batches.push(&texts[start..]);
    }
    batches
}

/// Scale to unit length; zero vectors stay zero.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalization() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn batches_split_on_item_cap() {
        let texts: Vec<String> = (0..10).map(|i| format!("t{i}")).collect();
        let batches = split_batches(&texts, 4, 1_000_000);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 4);
        assert_eq!(batches[2].len(), 2);
    }

    #[test]
    fn batches_split_on_char_cap() {
        let texts = vec!["a".repeat(60), "b".repeat(60), "c".repeat(60)];
        let batches = split_batches(&texts, 100, 100);
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn oversized_single_text_still_ships() {
        let texts = vec!["x".repeat(500)];
        let batches = split_batches(&texts, 10, 100);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn fingerprint_shape() {
        let client = EmbeddingClient::new("http://localhost:11434", "nomic-embed-text");
        assert_eq!(client.fingerprint(), "ollama:nomic-embed-text:0");
    }
}
