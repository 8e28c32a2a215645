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

use crate::types::{ContractError, ContractResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Scenario constraints applied to cross-scene similarity hits. Applied as
/// a post-filter in application code, not pushed into the index query, so
/// indexes that predate these metadata fields keep working.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioFilters {
    pub environments: Vec<String>,
    pub weather: Vec<String>,
    pub risk_threshold: Option<f64>,
    pub manoeuvres: Vec<String>,
}

impl ScenarioFilters {
    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
            && self.weather.is_empty()
            && self.risk_threshold.is_none()
            && self.manoeuvres.is_empty()
    }

    /// True when a hit's metadata satisfies every populated filter. A hit
    /// missing a field that a filter constrains is rejected; a filter left
    /// empty constrains nothing.
    pub fn matches_metadata(&self, metadata: &Value) -> bool {
        if !self.environments.is_empty()
            && !Self::field_in(metadata, "environment", &self.environments)
        {
            return false;
        }
        if !self.weather.is_empty() && !Self::field_in(metadata, "weather", &self.weather) {
            return false;
        }
        if !self.manoeuvres.is_empty() && !Self::field_in(metadata, "manoeuvre", &self.manoeuvres) {
            return false;
        }
        if let Some(threshold) = self.risk_threshold {
            match metadata.get("risk_score").and_then(Value::as_f64) {
                Some(risk) if risk >= threshold => {}
                _ => return false,
            }
        }
        true
    }

    fn field_in(metadata: &Value, field: &str, allowed: &[String]) -> bool {
        metadata
            .get(field)
            .and_then(Value::as_str)
            .map(|v| allowed.iter().any(|a| a.eq_ignore_ascii_case(v)))
            .unwrap_or(false)
    }
}

/// Structured workflow parameters produced once per business-objective
/// request by the objective interpreter. Read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowParams {
    pub objective: String,
    pub filters: ScenarioFilters,
    pub required_analyses: Vec<String>,
    pub target_metrics: Vec<String>,
    pub priority: Priority,
    pub max_cycles: u32,
    pub convergence_threshold: f64,
}

impl Default for WorkflowParams {
    fn default() -> Self {
        Self {
            objective: String::new(),
            filters: ScenarioFilters::default(),
            required_analyses: Vec::new(),
            target_metrics: Vec::new(),
            priority: Priority::default(),
            max_cycles: 3,
            convergence_threshold: 0.85,
        }
    }
}

/// Top-level fields the generation service must return. Absence of any of
/// them is a schema violation, not something to patch over.
pub const REQUIRED_OBJECTIVE_FIELDS: [&str; 4] = [
    "objective",
    "scenario_filters",
    "required_analyses",
    "target_metrics",
];

impl WorkflowParams {
    /// Builds params from the generation service's structured output.
    /// Strict on the required fields, lenient on the rest.
    pub fn from_interpreted(value: &Value) -> ContractResult<Self> {
        let obj = value.as_object().ok_or_else(|| ContractError::MalformedField {
            field: "root".to_string(),
            detail: "expected a JSON object".to_string(),
        })?;

        for field in REQUIRED_OBJECTIVE_FIELDS {
            if !obj.contains_key(field) {
                return Err(ContractError::MissingField(field.to_string()));
            }
        }

        let objective = value["objective"]
            .as_str()
            .ok_or_else(|| ContractError::MalformedField {
                field: "objective".to_string(),
                detail: "expected a string".to_string(),
            })?
            .to_string();

        let filters_value = &value["scenario_filters"];
        let filters = ScenarioFilters {
            environments: string_list(filters_value, "environments"),
            weather: string_list(filters_value, "weather"),
            risk_threshold: filters_value.get("risk_threshold").and_then(Value::as_f64),
            manoeuvres: string_list(filters_value, "manoeuvres"),
        };

        let priority = value
            .get("priority")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let defaults = WorkflowParams::default();
        Ok(Self {
            objective,
            filters,
            required_analyses: string_list(value, "required_analyses"),
            target_metrics: string_list(value, "target_metrics"),
            priority,
            max_cycles: value
                .get("max_cycles")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(defaults.max_cycles),
            convergence_threshold: value
                .get("convergence_threshold")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.convergence_threshold),
        })
    }
}

fn string_list(parent: &Value, field: &str) -> Vec<String> {
    parent
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
