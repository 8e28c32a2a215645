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

//! Cross-scene enrichment between cycles: similarity hits against other
//! scenes, post-filtered by the workflow's scenario constraints.

use crate::index::VectorIndex;
use agent_contracts::{Scene, ScenarioFilters, SimilarSceneSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossSceneConfig {
    pub index_name: String,
    /// Hits below this similarity are discarded. Hard-coded upstream with
    /// no documented derivation; kept configurable.
    pub similarity_cutoff: f64,
    pub max_results: usize,
    /// Raw neighbours fetched before post-filtering.
    pub top_k: usize,
}

impl Default for CrossSceneConfig {
    fn default() -> Self {
        Self {
            index_name: "scenes".to_string(),
            similarity_cutoff: 0.7,
            max_results: 5,
            top_k: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossSceneContext {
    pub similar_scenes: Vec<SimilarSceneSummary>,
    pub pattern_insights: Vec<String>,
}

impl CrossSceneContext {
    pub fn size(&self) -> usize {
        self.similar_scenes.len()
    }

    /// Free-text rendering injected into agent payloads as cross-reference
    /// material.
    pub fn cross_reference_text(&self) -> String {
        let mut lines: Vec<String> = self
            .similar_scenes
            .iter()
            .map(|s| format!("similar scene {} (similarity {:.2})", s.scene_id, s.similarity))
            .collect();
        lines.extend(self.pattern_insights.iter().cloned());
        lines.join("\n")
    }
}

/// Queries the index with the scene's primary embedding and applies the
/// scenario filters in application code. The filters are deliberately not
/// pushed into the index query so indexes that predate these metadata
/// fields keep working. Enrichment failure degrades to an empty context:
/// later cycles run without it rather than failing.
pub async fn enrich(
    index: &dyn VectorIndex,
    config: &CrossSceneConfig,
    scene: &Scene,
    filters: &ScenarioFilters,
) -> CrossSceneContext {
    let Some(vector) = scene.primary_embedding() else {
        debug!(scene = %scene.id, "Scene has no embeddings, skipping cross-scene enrichment");
        return CrossSceneContext::default();
    };

    let matches = match index.query(&config.index_name, vector, config.top_k).await {
        Ok(matches) => matches,
        Err(e) => {
            warn!(error = %e, "Cross-scene query failed, continuing without enrichment");
            return CrossSceneContext::default();
        }
    };

    let mut similar_scenes: Vec<SimilarSceneSummary> = matches
        .into_iter()
        .filter(|m| m.id != scene.id)
        .map(|m| SimilarSceneSummary {
            scene_id: m.id,
            similarity: 1.0 - m.distance,
            metadata: m.metadata,
        })
        .filter(|s| s.similarity >= config.similarity_cutoff)
        .filter(|s| filters.matches_metadata(&s.metadata))
        .collect();
    similar_scenes.truncate(config.max_results);

    let pattern_insights = derive_pattern_insights(&similar_scenes);
    debug!(
        scene = %scene.id,
        hits = similar_scenes.len(),
        insights = pattern_insights.len(),
        "Cross-scene context assembled"
    );

    CrossSceneContext {
        similar_scenes,
        pattern_insights,
    }
}

/// Shared metadata values across the retained hits read as patterns:
/// "3 of 4 similar scenes share weather 'rain'".
fn derive_pattern_insights(similar_scenes: &[SimilarSceneSummary]) -> Vec<String> {
    let total = similar_scenes.len();
    if total < 2 {
        return Vec::new();
    }

    let mut insights = Vec::new();
    for field in ["environment", "weather", "manoeuvre"] {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for scene in similar_scenes {
            if let Some(value) = scene.metadata.get(field).and_then(Value::as_str) {
                *counts.entry(value).or_default() += 1;
            }
        }
        if let Some((value, count)) = counts.into_iter().max_by_key(|(_, count)| *count) {
            if count >= 2 {
                insights.push(format!(
                    "{count} of {total} similar scenes share {field} '{value}'"
                ));
            }
        }
    }
    insights
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryVectorIndex;
    use serde_json::json;

    fn populated_index() -> MemoryVectorIndex {
        let index = MemoryVectorIndex::new();
        index.insert(
            "scenes",
            "scene-close",
            vec![1.0, 0.0],
            json!({"environment": "urban", "weather": "rain"}),
        );
        index.insert(
            "scenes",
            "scene-mid",
            vec![0.9, 0.3],
            json!({"environment": "urban", "weather": "rain"}),
        );
        index.insert(
            "scenes",
            "scene-far",
            vec![0.0, 1.0],
            json!({"environment": "rural", "weather": "clear"}),
        );
        index
    }

    #[tokio::test]
    async fn low_similarity_hits_are_discarded() {
        let index = populated_index();
        let scene = Scene::new("scene-query").with_embedding("fused", vec![1.0, 0.0]);
        let context = enrich(
            &index,
            &CrossSceneConfig::default(),
            &scene,
            &ScenarioFilters::default(),
        )
        .await;

        assert!(context
            .similar_scenes
            .iter()
            .all(|s| s.similarity >= 0.7));
        assert!(!context
            .similar_scenes
            .iter()
            .any(|s| s.scene_id == "scene-far"));
    }

    #[tokio::test]
    async fn scenario_filters_post_filter_hits() {
        let index = populated_index();
        let scene = Scene::new("scene-query").with_embedding("fused", vec![1.0, 0.0]);
        let filters = ScenarioFilters {
            weather: vec!["snow".to_string()],
            ..Default::default()
        };
        let context = enrich(&index, &CrossSceneConfig::default(), &scene, &filters).await;
        assert!(context.similar_scenes.is_empty());
    }

    #[tokio::test]
    async fn own_scene_is_excluded() {
        let index = populated_index();
        index.insert("scenes", "scene-query", vec![1.0, 0.0], json!({}));
        let scene = Scene::new("scene-query").with_embedding("fused", vec![1.0, 0.0]);
        let context = enrich(
            &index,
            &CrossSceneConfig::default(),
            &scene,
            &ScenarioFilters::default(),
        )
        .await;
        assert!(!context
            .similar_scenes
            .iter()
            .any(|s| s.scene_id == "scene-query"));
    }

    #[tokio::test]
    async fn shared_metadata_becomes_pattern_insights() {
        let index = populated_index();
        let scene = Scene::new("scene-query").with_embedding("fused", vec![1.0, 0.0]);
        let context = enrich(
            &index,
            &CrossSceneConfig::default(),
            &scene,
            &ScenarioFilters::default(),
        )
        .await;

        assert!(context
            .pattern_insights
            .iter()
            .any(|i| i.contains("weather 'rain'")));
    }

    #[tokio::test]
    async fn enrichment_failure_is_an_empty_context() {
        let index = crate::index::FailingVectorIndex {
            message: "offline".to_string(),
        };
        let scene = Scene::new("scene-query").with_embedding("fused", vec![1.0]);
        let context = enrich(
            &index,
            &CrossSceneConfig::default(),
            &scene,
            &ScenarioFilters::default(),
        )
        .await;
        assert_eq!(context.size(), 0);
        assert!(context.pattern_insights.is_empty());
    }
}
