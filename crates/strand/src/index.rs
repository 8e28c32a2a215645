// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| Client::builder().build().expect("HTTP client"));

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index query failed: {0}")]
    QueryFailed(String),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Malformed index response: {0}")]
    MalformedResponse(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// One ranked neighbour returned by a similarity query. Distances are in
/// [0, ~2] with 0 meaning identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMatch {
    pub id: String,
    pub distance: f64,
    pub metadata: Value,
}

/// Query-by-vector similarity search against a named index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(
        &self,
        index_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> IndexResult<Vec<QueryMatch>>;
}

/// Remote index service client. Expects a JSON endpoint that accepts
/// `{index, vector, top_k, want_distance, want_metadata}` and returns
/// `{matches: [{id, distance, metadata}]}`.
#[derive(Debug, Clone)]
pub struct HttpVectorIndex {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl HttpVectorIndex {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn from_env() -> IndexResult<Self> {
        let endpoint = std::env::var("VECTOR_INDEX_ENDPOINT")
            .map_err(|_| IndexError::QueryFailed("VECTOR_INDEX_ENDPOINT not set".to_string()))?;
        Ok(Self {
            endpoint,
            api_key: std::env::var("VECTOR_INDEX_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl VectorIndex for HttpVectorIndex {
    async fn query(
        &self,
        index_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> IndexResult<Vec<QueryMatch>> {
        let payload = json!({
            "index": index_name,
            "vector": vector,
            "top_k": top_k,
            "want_distance": true,
            "want_metadata": true,
        });

        let mut request = HTTP_CLIENT.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| IndexError::QueryFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IndexError::QueryFailed(format!(
                "index service returned {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| IndexError::MalformedResponse(e.to_string()))?;

        let matches = body
            .get("matches")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                IndexError::MalformedResponse("missing 'matches' array".to_string())
            })?;

        let mut results = Vec::with_capacity(matches.len());
        for entry in matches {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| IndexError::MalformedResponse("match without id".to_string()))?;
            let distance = entry
                .get("distance")
                .and_then(Value::as_f64)
                .ok_or_else(|| {
                    IndexError::MalformedResponse("match without distance".to_string())
                })?;
            results.push(QueryMatch {
                id: id.to_string(),
                distance,
                metadata: entry.get("metadata").cloned().unwrap_or(Value::Null),
            });
        }

        debug!(
            index = index_name,
            hits = results.len(),
            "Vector index query completed"
        );
        Ok(results)
    }
}

/// In-process index over normalised cosine distance. Backs tests and local
/// runs where no index service is reachable.
#[derive(Default)]
pub struct MemoryVectorIndex {
    tables: RwLock<HashMap<String, Vec<(String, Vec<f32>, Value)>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        index_name: &str,
        id: impl Into<String>,
        vector: Vec<f32>,
        metadata: Value,
    ) {
        let mut tables = self.tables.write().expect("index table lock");
        tables
            .entry(index_name.to_string())
            .or_default()
            .push((id.into(), vector, metadata));
    }

    fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
        let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 1.0;
        }
        1.0 - dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn query(
        &self,
        index_name: &str,
        vector: &[f32],
        top_k: usize,
    ) -> IndexResult<Vec<QueryMatch>> {
        let tables = self.tables.read().expect("index table lock");
        let entries = match tables.get(index_name) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let mut results: Vec<QueryMatch> = entries
            .iter()
            .map(|(id, stored, metadata)| QueryMatch {
                id: id.clone(),
                distance: Self::cosine_distance(vector, stored),
                metadata: metadata.clone(),
            })
            .collect();
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(top_k);
        Ok(results)
    }
}

/// Scripted index that always fails; exercises fail-open paths in tests.
pub struct FailingVectorIndex {
    pub message: String,
}

#[async_trait]
impl VectorIndex for FailingVectorIndex {
    async fn query(&self, _: &str, _: &[f32], _: usize) -> IndexResult<Vec<QueryMatch>> {
        Err(IndexError::QueryFailed(self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_index_ranks_by_distance() {
        let index = MemoryVectorIndex::new();
        index.insert("scenes", "near", vec![1.0, 0.0], Value::Null);
        index.insert("scenes", "far", vec![0.0, 1.0], Value::Null);

        let matches = index.query("scenes", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "near");
        assert!(matches[0].distance < 1e-9);
        assert!(matches[1].distance > matches[0].distance);
    }

    #[tokio::test]
    async fn unknown_index_is_empty_not_an_error() {
        let index = MemoryVectorIndex::new();
        let matches = index.query("missing", &[1.0], 5).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn top_k_truncates() {
        let index = MemoryVectorIndex::new();
        for i in 0..10 {
            index.insert("scenes", format!("s-{i}"), vec![1.0, i as f32], Value::Null);
        }
        let matches = index.query("scenes", &[1.0, 0.0], 3).await.unwrap();
        assert_eq!(matches.len(), 3);
    }
}
