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

use crate::types::{AgentType, ContractError, ContractResult, SENTINEL_SCENE_ID};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub metrics: HashMap<String, Value>,
    /// Confidence in [0, 1] when the agent reported one.
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub issue_count: usize,
    pub issues: Vec<String>,
    pub mentions_scene: bool,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

impl ValidationReport {
    pub fn clean(mentions_scene: bool) -> Self {
        Self {
            issue_count: 0,
            issues: Vec::new(),
            mentions_scene,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn with_issues(issues: Vec<String>, mentions_scene: bool) -> Self {
        Self {
            issue_count: issues.len(),
            issues,
            mentions_scene,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn push_issue(&mut self, issue: impl Into<String>) {
        self.issues.push(issue.into());
        self.issue_count = self.issues.len();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub invoked_agent: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self {
            invoked_agent: None,
            started_at: chrono::Utc::now(),
            duration_ms: 0,
        }
    }
}

/// Canonical normalised output of one agent node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent_type: AgentType,
    pub scene_id: String,
    pub status: ResponseStatus,
    pub analysis: Analysis,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
    pub validation: ValidationReport,
    pub metadata: ResponseMetadata,
}

impl AgentResponse {
    /// Empty-but-valid substitute recorded when an invocation produced
    /// nothing usable. The chain continues; the gap is visible in the
    /// validation report.
    pub fn empty(agent_type: AgentType, scene_id: impl Into<String>) -> Self {
        Self {
            agent_type,
            scene_id: scene_id.into(),
            status: ResponseStatus::Success,
            analysis: Analysis::default(),
            insights: Vec::new(),
            recommendations: Vec::new(),
            validation: ValidationReport::with_issues(
                vec!["agent returned no usable output".to_string()],
                false,
            ),
            metadata: ResponseMetadata::default(),
        }
    }

    /// Scene id schema constraint: downstream cross-scene joins key on it,
    /// so the sentinel and empty values are rejected rather than passed on.
    pub fn validate_scene_id(&self) -> ContractResult<()> {
        if self.scene_id.trim().is_empty() || self.scene_id == SENTINEL_SCENE_ID {
            return Err(ContractError::InvalidSceneId(self.scene_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_response_records_a_validation_issue() {
        let response = AgentResponse::empty(AgentType::Coordinator, "scene-0007");
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.validation.issue_count, 1);
        assert!(response.insights.is_empty());
    }

    #[test]
    fn sentinel_scene_id_fails_validation() {
        let response = AgentResponse::empty(AgentType::Coordinator, SENTINEL_SCENE_ID);
        assert!(response.validate_scene_id().is_err());

        let response = AgentResponse::empty(AgentType::Coordinator, "scene-0007");
        assert!(response.validate_scene_id().is_ok());
    }

    #[test]
    fn validation_report_tracks_issue_count() {
        let mut report = ValidationReport::clean(true);
        report.push_issue("first");
        report.push_issue("second");
        assert_eq!(report.issue_count, 2);
    }
}
