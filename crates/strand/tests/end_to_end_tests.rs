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

use agent_contracts::{AgentType, Scene, WorkflowParams};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use strand::invoke::ScriptedInvoker;
use strand::store::MemoryResultStore;
use strand::{
    run_scene_pipeline, AnomalyDetector, MemoryVectorIndex, PipelineConfig, SceneTask,
    TaskFailure, TaskReporter, TaskSuccess, TerminationReason, DEFAULT_ANOMALY_THRESHOLD,
};

#[derive(Default)]
struct CapturingReporter {
    successes: Mutex<Vec<(String, TaskSuccess)>>,
    failures: Mutex<Vec<(String, TaskFailure)>>,
}

#[async_trait]
impl TaskReporter for CapturingReporter {
    async fn report_success(&self, task_token: &str, success: &TaskSuccess) {
        self.successes
            .lock()
            .unwrap()
            .push((task_token.to_string(), success.clone()));
    }

    async fn report_failure(&self, task_token: &str, failure: &TaskFailure) {
        self.failures
            .lock()
            .unwrap()
            .push((task_token.to_string(), failure.clone()));
    }
}

/// A unit vector at cosine distance 0.1 from [1, 0].
fn reference_vector() -> Vec<f32> {
    vec![0.9, (1.0f32 - 0.81).sqrt()]
}

fn reference_index(config: &PipelineConfig) -> MemoryVectorIndex {
    let index = MemoryVectorIndex::new();
    for i in 0..3 {
        index.insert(
            &config.reference_index,
            format!("ref-{i}"),
            reference_vector(),
            Value::Null,
        );
    }
    index
}

fn scripted_agents() -> ScriptedInvoker {
    let invoker = ScriptedInvoker::new();
    for agent_type in AgentType::pipeline() {
        invoker.script(
            agent_type.as_str(),
            Ok(json!({
                "analysis": {
                    "summary": format!("{agent_type} looked at scene-0042"),
                    "key_findings": ["steady traffic flow"]
                },
                "insights": ["scene resembles its reference cluster"],
                "recommendations": ["no follow-up required"]
            })),
        );
    }
    invoker
}

#[tokio::test]
async fn known_scene_is_not_anomalous_and_single_cycle_reaches_max() {
    let config = PipelineConfig::default();
    let index = Arc::new(reference_index(&config));

    // Three references at distance 0.1: similarity 0.9 beats the 0.75
    // threshold, so the scene is not an anomaly.
    let detector = AnomalyDetector::new(index.clone(), config.reference_index.clone());
    let context = detector.detect(&[1.0, 0.0], DEFAULT_ANOMALY_THRESHOLD).await;
    assert!(!context.is_anomaly);
    assert!((context.closest_similarity.unwrap() - 0.9).abs() < 1e-3);

    let scene = Scene::new("scene-0042").with_embedding("fused", vec![1.0, 0.0]);
    let params = WorkflowParams {
        objective: "routine_review".to_string(),
        max_cycles: 1,
        ..Default::default()
    };

    let output_dir = tempfile::tempdir().unwrap();
    let output_location = output_dir
        .path()
        .join("scene-0042.json")
        .to_string_lossy()
        .into_owned();
    let task = SceneTask {
        scene_id: "scene-0042".to_string(),
        input_location: "input/scene-0042".to_string(),
        output_location: output_location.clone(),
        task_token: "token-1".to_string(),
    };

    let reporter = Arc::new(CapturingReporter::default());
    let result = run_scene_pipeline(
        config,
        index,
        Arc::new(scripted_agents()),
        Arc::new(MemoryResultStore::new()),
        reporter.clone(),
        &task,
        &scene,
        &params,
    )
    .await
    .unwrap();

    // Exactly one cycle ran and stopped at the cycle budget.
    assert_eq!(result.termination, TerminationReason::MaxCyclesReached);
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.cycles_completed, 1);
    assert_eq!(result.final_results.len(), 4);

    // The persisted payload mirrors the returned aggregate.
    let written = std::fs::read_to_string(&output_location).unwrap();
    let payload: Value = serde_json::from_str(&written).unwrap();
    assert_eq!(payload["termination"], "max_cycles_reached");
    assert_eq!(payload["scene_id"], "scene-0042");

    // The workflow engine heard a success on the task token.
    let successes = reporter.successes.lock().unwrap();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].0, "token-1");
    assert!(successes[0].1.summary.contains("max_cycles_reached"));
    assert!(reporter.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sentinel_scene_is_rejected_before_any_cycle() {
    let config = PipelineConfig::default();
    let index = Arc::new(MemoryVectorIndex::new());
    let scene = Scene::new("unknown").with_embedding("fused", vec![1.0]);
    let params = WorkflowParams {
        max_cycles: 1,
        ..Default::default()
    };

    let output_dir = tempfile::tempdir().unwrap();
    let task = SceneTask {
        scene_id: "unknown".to_string(),
        input_location: "input/unknown".to_string(),
        output_location: output_dir
            .path()
            .join("unknown.json")
            .to_string_lossy()
            .into_owned(),
        task_token: "token-2".to_string(),
    };

    let reporter = Arc::new(CapturingReporter::default());
    let err = run_scene_pipeline(
        config,
        index,
        Arc::new(ScriptedInvoker::new()),
        Arc::new(MemoryResultStore::new()),
        reporter.clone(),
        &task,
        &scene,
        &params,
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("Invalid scene"));
    let failures = reporter.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1.error_kind, "invalid_scene");
}
