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

use crate::index::VectorIndex;
use agent_contracts::AnomalyContext;
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_ANOMALY_THRESHOLD: f64 = 0.75;
const NEIGHBOUR_COUNT: usize = 5;

/// Scores a scene's isolation from its nearest neighbours in a fixed
/// reference index. Enrichment only: it must never block the pipeline, so
/// every query error fails open.
pub struct AnomalyDetector {
    index: Arc<dyn VectorIndex>,
    reference_index: String,
}

impl AnomalyDetector {
    pub fn new(index: Arc<dyn VectorIndex>, reference_index: impl Into<String>) -> Self {
        Self {
            index,
            reference_index: reference_index.into(),
        }
    }

    pub async fn detect(&self, scene_vector: &[f32], threshold: f64) -> AnomalyContext {
        let matches = match self
            .index
            .query(&self.reference_index, scene_vector, NEIGHBOUR_COUNT)
            .await
        {
            Ok(matches) => matches,
            Err(e) => {
                warn!(error = %e, "Anomaly query failed, failing open");
                return AnomalyContext::fail_open(format!("detector query failed: {e}"));
            }
        };

        if matches.is_empty() {
            debug!("Reference index empty, treating scene as novel");
            return AnomalyContext::cold_start();
        }

        let closest_distance = matches
            .iter()
            .map(|m| m.distance)
            .fold(f64::INFINITY, f64::min);
        // Assumes normalised cosine distance in [0, 1]; other metrics are
        // not re-normalised here.
        let closest_similarity = 1.0 - closest_distance;
        let is_anomaly = closest_similarity < threshold;

        AnomalyContext {
            is_anomaly,
            anomaly_score: closest_distance,
            closest_similarity: Some(closest_similarity),
            reason: if is_anomaly {
                format!(
                    "closest reference similarity {closest_similarity:.3} below threshold {threshold:.2}"
                )
            } else {
                format!(
                    "closest reference similarity {closest_similarity:.3} meets threshold {threshold:.2}"
                )
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FailingVectorIndex, MemoryVectorIndex};
    use serde_json::Value;

    #[tokio::test]
    async fn empty_index_is_cold_start() {
        let detector = AnomalyDetector::new(Arc::new(MemoryVectorIndex::new()), "reference");
        let context = detector.detect(&[1.0, 0.0], DEFAULT_ANOMALY_THRESHOLD).await;
        assert!(context.is_anomaly);
        assert!((context.anomaly_score - 1.0).abs() < f64::EPSILON);
        assert!(context.closest_similarity.is_none());
    }

    #[tokio::test]
    async fn close_neighbour_is_not_anomalous() {
        let index = MemoryVectorIndex::new();
        index.insert("reference", "twin", vec![1.0, 0.0], Value::Null);
        let detector = AnomalyDetector::new(Arc::new(index), "reference");

        let context = detector.detect(&[1.0, 0.0], DEFAULT_ANOMALY_THRESHOLD).await;
        assert!(!context.is_anomaly);
        assert!(context.closest_similarity.unwrap() > 0.99);
    }

    #[tokio::test]
    async fn isolated_vector_is_anomalous() {
        let index = MemoryVectorIndex::new();
        index.insert("reference", "other", vec![0.0, 1.0], Value::Null);
        let detector = AnomalyDetector::new(Arc::new(index), "reference");

        let context = detector.detect(&[1.0, 0.0], DEFAULT_ANOMALY_THRESHOLD).await;
        assert!(context.is_anomaly);
    }

    #[tokio::test]
    async fn query_errors_fail_open() {
        let detector = AnomalyDetector::new(
            Arc::new(FailingVectorIndex {
                message: "index offline".to_string(),
            }),
            "reference",
        );
        let context = detector.detect(&[1.0], DEFAULT_ANOMALY_THRESHOLD).await;
        assert!(!context.is_anomaly);
        assert!((context.anomaly_score).abs() < f64::EPSILON);
        assert!(context.reason.contains("index offline"));
    }
}
