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

//! Per-scene root: wires the detector and cycle controller together on
//! behalf of the outer workflow engine and reports back through its task
//! token.

use crate::anomaly::AnomalyDetector;
use crate::cycles::{AggregatedResult, CycleController, CycleError};
use agent_contracts::{AnomalyContext, Scene, WorkflowParams};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| Client::builder().build().expect("HTTP client"));

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid scene: {0}")]
    InvalidScene(String),

    #[error("Failed to persist result: {0}")]
    Persistence(String),

    #[error(transparent)]
    Cycles(#[from] CycleError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Unit of work handed down by the outer workflow engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneTask {
    pub scene_id: String,
    pub input_location: String,
    pub output_location: String,
    pub task_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSuccess {
    pub output_location: String,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub error_kind: String,
    pub cause: String,
}

/// Reports task completion to the workflow engine. Reporting failures are
/// logged but never fail the run; the engine's own timeout covers a lost
/// callback.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report_success(&self, task_token: &str, success: &TaskSuccess);
    async fn report_failure(&self, task_token: &str, failure: &TaskFailure);
}

/// Callback client for the workflow engine's task-token endpoint.
#[derive(Debug, Clone)]
pub struct HttpTaskReporter {
    pub endpoint: String,
}

#[async_trait]
impl TaskReporter for HttpTaskReporter {
    async fn report_success(&self, task_token: &str, success: &TaskSuccess) {
        let payload = json!({
            "task_token": task_token,
            "status": "success",
            "output": success,
        });
        if let Err(e) = HTTP_CLIENT.post(&self.endpoint).json(&payload).send().await {
            warn!(error = %e, "Failed to report task success");
        }
    }

    async fn report_failure(&self, task_token: &str, failure: &TaskFailure) {
        let payload = json!({
            "task_token": task_token,
            "status": "failure",
            "error": failure,
        });
        if let Err(e) = HTTP_CLIENT.post(&self.endpoint).json(&payload).send().await {
            warn!(error = %e, "Failed to report task failure");
        }
    }
}

/// Reporter for local runs without a workflow engine attached.
#[derive(Debug, Clone, Default)]
pub struct LoggingTaskReporter;

#[async_trait]
impl TaskReporter for LoggingTaskReporter {
    async fn report_success(&self, task_token: &str, success: &TaskSuccess) {
        info!(
            token = task_token,
            output = %success.output_location,
            summary = %success.summary,
            "Task succeeded"
        );
    }

    async fn report_failure(&self, task_token: &str, failure: &TaskFailure) {
        warn!(
            token = task_token,
            kind = %failure.error_kind,
            cause = %failure.cause,
            "Task failed"
        );
    }
}

pub struct Orchestrator {
    detector: AnomalyDetector,
    controller: CycleController,
    reporter: std::sync::Arc<dyn TaskReporter>,
    anomaly_threshold: f64,
}

impl Orchestrator {
    pub fn new(
        detector: AnomalyDetector,
        controller: CycleController,
        reporter: std::sync::Arc<dyn TaskReporter>,
        anomaly_threshold: f64,
    ) -> Self {
        Self {
            detector,
            controller,
            reporter,
            anomaly_threshold,
        }
    }

    /// Processes one scene end to end: seed the anomaly context, run the
    /// cycle loop, persist the aggregated payload to the task's output
    /// location and report through the task token. Completed cycles are
    /// persisted even when a later cycle fails.
    pub async fn process_scene(
        &self,
        task: &SceneTask,
        scene: &Scene,
        params: &WorkflowParams,
    ) -> OrchestratorResult<AggregatedResult> {
        if !scene.has_valid_id() {
            let failure = TaskFailure {
                error_kind: "invalid_scene".to_string(),
                cause: format!("scene id '{}' is empty or a sentinel", scene.id),
            };
            self.reporter.report_failure(&task.task_token, &failure).await;
            return Err(OrchestratorError::InvalidScene(scene.id.clone()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            scene = %scene.id,
            session = %session_id,
            objective = %params.objective,
            max_cycles = params.max_cycles,
            "Starting scene pipeline"
        );

        let anomaly = match scene.primary_embedding() {
            Some(vector) => self.detector.detect(vector, self.anomaly_threshold).await,
            None => AnomalyContext::fail_open("scene has no embeddings to score"),
        };

        match self
            .controller
            .run(params, scene, &session_id, anomaly)
            .await
        {
            Ok(aggregated) => {
                let payload = serde_json::to_string_pretty(&aggregated).map_err(|e| {
                    OrchestratorError::Persistence(format!("failed to serialise result: {e}"))
                })?;
                self.persist(task, &payload).await?;

                let summary = format!(
                    "{} after {} cycles; {} agents; {} insights; {} recommendations",
                    aggregated.termination,
                    aggregated.cycles_completed,
                    aggregated.final_results.len(),
                    aggregated.all_insights.len(),
                    aggregated.all_recommendations.len()
                );
                self.reporter
                    .report_success(
                        &task.task_token,
                        &TaskSuccess {
                            output_location: task.output_location.clone(),
                            summary,
                        },
                    )
                    .await;
                Ok(aggregated)
            }
            Err(CycleError::FinalCycleFailed {
                cycle,
                cause,
                history,
            }) => {
                // Partial progress still lands at the output location.
                let payload = serde_json::to_string_pretty(&json!({
                    "scene_id": scene.id,
                    "session_id": session_id,
                    "failed_cycle": cycle,
                    "cause": cause,
                    "completed_cycles": history,
                }))
                .map_err(|e| {
                    OrchestratorError::Persistence(format!("failed to serialise result: {e}"))
                })?;
                if let Err(e) = self.persist(task, &payload).await {
                    warn!(error = %e, "Failed to persist partial progress");
                }

                self.reporter
                    .report_failure(
                        &task.task_token,
                        &TaskFailure {
                            error_kind: "cycle_failure".to_string(),
                            cause: cause.clone(),
                        },
                    )
                    .await;
                Err(CycleError::FinalCycleFailed {
                    cycle,
                    cause,
                    history,
                }
                .into())
            }
            Err(e) => {
                self.reporter
                    .report_failure(
                        &task.task_token,
                        &TaskFailure {
                            error_kind: "orchestration_failure".to_string(),
                            cause: e.to_string(),
                        },
                    )
                    .await;
                Err(e.into())
            }
        }
    }

    async fn persist(&self, task: &SceneTask, payload: &str) -> OrchestratorResult<()> {
        let path = std::path::Path::new(&task.output_location);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                OrchestratorError::Persistence(format!("failed to create output directory: {e}"))
            })?;
        }
        tokio::fs::write(path, payload).await.map_err(|e| {
            OrchestratorError::Persistence(format!("failed to write output: {e}"))
        })?;
        info!(output = %task.output_location, "Result persisted");
        Ok(())
    }
}
