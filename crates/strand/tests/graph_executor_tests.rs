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

use agent_contracts::{AgentType, AnomalyContext, Scene};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use strand::invoke::{AgentInvoker, InvokeError, InvokeResult, ScriptedInvoker};
use strand::store::{MemoryResultStore, ResultStore};
use strand::{AgentBinding, ExecutionState, GraphConfig, GraphExecutor, GraphRunStatus, RunContext};

/// Wraps the scripted invoker and records every payload it was handed.
struct RecordingInvoker {
    inner: ScriptedInvoker,
    requests: Mutex<Vec<(String, Value)>>,
}

impl RecordingInvoker {
    fn new(inner: ScriptedInvoker) -> Self {
        Self {
            inner,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn recorded(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentInvoker for RecordingInvoker {
    async fn invoke(
        &self,
        agent_ref: &str,
        session_id: &str,
        payload: &Value,
    ) -> InvokeResult<Value> {
        self.requests
            .lock()
            .unwrap()
            .push((agent_ref.to_string(), payload.clone()));
        self.inner.invoke(agent_ref, session_id, payload).await
    }
}

fn scene() -> Scene {
    Scene::new("scene-0042")
        .with_embedding("fused", vec![1.0, 0.0])
        .with_metric("harsh_braking", 0.4)
}

fn agent_output(summary: &str, insights: &[&str]) -> Value {
    json!({
        "analysis": {"summary": summary, "key_findings": [summary]},
        "insights": insights,
        "recommendations": []
    })
}

fn script_all(invoker: &ScriptedInvoker) {
    for agent_type in AgentType::pipeline() {
        invoker.script(
            agent_type.as_str(),
            Ok(agent_output(&format!("{agent_type} summary"), &["insight"])),
        );
    }
}

#[tokio::test]
async fn all_four_nodes_run_in_sequence() {
    let scripted = ScriptedInvoker::new();
    script_all(&scripted);
    let invoker = Arc::new(RecordingInvoker::new(scripted));
    let store = MemoryResultStore::new();

    let executor = GraphExecutor::new(
        invoker.clone(),
        Arc::new(store.clone()),
        AgentBinding::defaults(),
        GraphConfig::default(),
    );

    let mut state = ExecutionState::new(&scene(), "session-1", AnomalyContext::fail_open("n/a"));
    let report = executor.run(&mut state, &RunContext::default()).await;

    assert_eq!(report.status, GraphRunStatus::Completed);
    assert_eq!(report.node_outcomes.len(), 4);
    assert_eq!(state.execution_order(), &AgentType::pipeline());

    // Later nodes saw every earlier node's result.
    let recorded = invoker.recorded();
    let (ref last_agent, ref last_payload) = recorded[3];
    assert_eq!(last_agent, AgentType::SimilaritySearch.as_str());
    assert_eq!(
        last_payload["prior_results"].as_array().unwrap().len(),
        3
    );
    // The payload is a plain object carrying the anomaly context.
    assert!(last_payload["anomaly"].is_object());
    assert!(last_payload.get("request").is_none());

    // Every result is durably visible in the side-store.
    for agent_type in AgentType::pipeline() {
        assert!(store
            .get("scene-0042", agent_type)
            .await
            .unwrap()
            .is_some());
    }
}

#[tokio::test]
async fn node_failure_halts_the_chain() {
    let scripted = ScriptedInvoker::new();
    scripted.script(
        AgentType::Coordinator.as_str(),
        Ok(agent_output("coordinator", &[])),
    );
    scripted.script(
        AgentType::SceneUnderstanding.as_str(),
        Err(InvokeError::InvocationFailed("connection reset".to_string())),
    );
    // Nodes 3 and 4 are scripted so an erroneous continuation would be
    // visible as extra execution-order entries.
    scripted.script(
        AgentType::AnomalyDetection.as_str(),
        Ok(agent_output("anomaly", &[])),
    );
    scripted.script(
        AgentType::SimilaritySearch.as_str(),
        Ok(agent_output("similarity", &[])),
    );

    let executor = GraphExecutor::new(
        Arc::new(scripted),
        Arc::new(MemoryResultStore::new()),
        AgentBinding::defaults(),
        GraphConfig::default(),
    );

    let mut state = ExecutionState::new(&scene(), "session-1", AnomalyContext::fail_open("n/a"));
    let report = executor.run(&mut state, &RunContext::default()).await;

    assert_eq!(report.status, GraphRunStatus::Failed);
    assert!(report.error.unwrap().contains("scene_understanding"));
    assert_eq!(state.execution_order(), &[AgentType::Coordinator]);
    assert!(state.result(AgentType::AnomalyDetection).is_none());
    assert!(state.result(AgentType::SimilaritySearch).is_none());
}

#[tokio::test]
async fn bad_status_is_substituted_not_fatal() {
    let scripted = ScriptedInvoker::new();
    scripted.script(
        AgentType::Coordinator.as_str(),
        Err(InvokeError::BadStatus {
            agent_ref: AgentType::Coordinator.as_str().to_string(),
            status: 503,
            body: "unavailable".to_string(),
        }),
    );
    for agent_type in &AgentType::pipeline()[1..] {
        scripted.script(
            agent_type.as_str(),
            Ok(agent_output(&format!("{agent_type}"), &[])),
        );
    }

    let executor = GraphExecutor::new(
        Arc::new(scripted),
        Arc::new(MemoryResultStore::new()),
        AgentBinding::defaults(),
        GraphConfig::default(),
    );

    let mut state = ExecutionState::new(&scene(), "session-1", AnomalyContext::fail_open("n/a"));
    let report = executor.run(&mut state, &RunContext::default()).await;

    assert_eq!(report.status, GraphRunStatus::Completed);
    assert!(report.node_outcomes[0].substituted);
    let substitute = state.result(AgentType::Coordinator).unwrap();
    assert!(substitute.insights.is_empty());
    assert!(substitute.validation.issue_count >= 1);
}

#[tokio::test]
async fn garbled_free_text_response_is_salvaged() {
    let scripted = ScriptedInvoker::new();
    scripted.script(
        AgentType::Coordinator.as_str(),
        Ok(Value::String(
            "Not JSON.\n- a salvaged finding\nWe should verify manually.".to_string(),
        )),
    );
    for agent_type in &AgentType::pipeline()[1..] {
        scripted.script(
            agent_type.as_str(),
            Ok(agent_output(&format!("{agent_type}"), &[])),
        );
    }

    let executor = GraphExecutor::new(
        Arc::new(scripted),
        Arc::new(MemoryResultStore::new()),
        AgentBinding::defaults(),
        GraphConfig::default(),
    );

    let mut state = ExecutionState::new(&scene(), "session-1", AnomalyContext::fail_open("n/a"));
    let report = executor.run(&mut state, &RunContext::default()).await;

    assert_eq!(report.status, GraphRunStatus::Completed);
    let salvaged = state.result(AgentType::Coordinator).unwrap();
    assert_eq!(
        salvaged.analysis.key_findings,
        vec!["a salvaged finding".to_string()]
    );
    assert_eq!(
        salvaged.recommendations,
        vec!["We should verify manually.".to_string()]
    );
}
