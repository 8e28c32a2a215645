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

//! Converts a free-text business objective into structured workflow
//! parameters. A malformed objective would silently corrupt every
//! downstream cycle filter, so this is the one place that fails hard
//! instead of open.

use agent_contracts::{WorkflowParams, REQUIRED_OBJECTIVE_FIELDS};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| Client::builder().build().expect("HTTP client"));

#[derive(Debug, Error)]
pub enum ObjectiveError {
    #[error("Generation service error: {0}")]
    Generation(String),

    #[error("Objective interpretation failed after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

pub type ObjectiveResult<T> = Result<T, ObjectiveError>;

/// Single-turn structured text generation at low temperature.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> ObjectiveResult<String>;
}

/// Messages-API style generation client. Temperature stays low; the
/// interpreter needs deterministic structured output, not prose.
#[derive(Debug, Clone)]
pub struct HttpTextGenerator {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl HttpTextGenerator {
    pub fn from_env() -> ObjectiveResult<Self> {
        let api_key = std::env::var("GENERATION_API_KEY")
            .map_err(|_| ObjectiveError::Generation("GENERATION_API_KEY not set".to_string()))?;
        Ok(Self {
            endpoint: std::env::var("GENERATION_ENDPOINT")
                .unwrap_or_else(|_| "https://api.anthropic.com/v1/messages".to_string()),
            api_key,
            model: std::env::var("GENERATION_MODEL")
                .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string()),
            max_tokens: 4096,
            temperature: 0.1,
        })
    }
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> ObjectiveResult<String> {
        let payload = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system_prompt,
            "messages": [{ "role": "user", "content": user_prompt }],
            "temperature": self.temperature
        });

        let response = HTTP_CLIENT
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ObjectiveError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ObjectiveError::Generation(format!(
                "generation service returned {status}: {body}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ObjectiveError::Generation(e.to_string()))?;
        body["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ObjectiveError::Generation("no text content in generation response".to_string())
            })
    }
}

/// Scripted generator for tests and offline runs: responses pop in order.
#[derive(Default)]
pub struct ScriptedGenerator {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
        }
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, _: &str, _: &str) -> ObjectiveResult<String> {
        let mut responses = self.responses.lock().expect("script lock");
        if responses.is_empty() {
            return Err(ObjectiveError::Generation("script exhausted".to_string()));
        }
        Ok(responses.remove(0))
    }
}

#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    pub max_attempts: u32,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

pub struct ObjectiveInterpreter {
    generator: std::sync::Arc<dyn TextGenerator>,
    config: InterpreterConfig,
}

impl ObjectiveInterpreter {
    pub fn new(generator: std::sync::Arc<dyn TextGenerator>, config: InterpreterConfig) -> Self {
        Self { generator, config }
    }

    pub async fn interpret(
        &self,
        objective_text: &str,
        scene_context: Option<&str>,
    ) -> ObjectiveResult<WorkflowParams> {
        let system_prompt = build_system_prompt();
        let mut last_error = String::new();

        for attempt in 1..=self.config.max_attempts {
            let user_prompt = build_user_prompt(objective_text, scene_context, &last_error);
            let response = match self.generator.generate(&system_prompt, &user_prompt).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(attempt, error = %e, "Generation attempt failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            match parse_params(&response) {
                Ok(params) => {
                    debug!(attempt, objective = %params.objective, "Objective interpreted");
                    return Ok(params);
                }
                Err(issue) => {
                    // The generator sees its own mistake on the next turn.
                    warn!(attempt, issue = %issue, "Structured output rejected");
                    last_error = issue;
                }
            }
        }

        Err(ObjectiveError::ExhaustedRetries {
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

fn parse_params(response: &str) -> Result<WorkflowParams, String> {
    let value = extract_json_span(response)
        .ok_or_else(|| "no parseable JSON object found in response".to_string())?;
    WorkflowParams::from_interpreted(&value).map_err(|e| e.to_string())
}

/// Extracts the structured object from a generation response. The
/// first-brace-to-last-brace span is tried first; when prose or an earlier
/// malformed block breaks that, the last parseable balanced span wins.
pub fn extract_json_span(text: &str) -> Option<Value> {
    let first = text.find('{')?;
    let last = text.rfind('}')?;
    if last > first {
        if let Ok(value) = serde_json::from_str::<Value>(&text[first..=last]) {
            return Some(value);
        }
    }

    let mut result = None;
    let mut balance = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                if balance == 0 {
                    start = Some(i);
                }
                balance += 1;
            }
            '}' if !in_string => {
                balance -= 1;
                if balance == 0 {
                    if let Some(s) = start {
                        if let Ok(value) = serde_json::from_str::<Value>(&text[s..=i]) {
                            result = Some(value);
                        }
                    }
                } else if balance < 0 {
                    // A stray closing brace resets the scan.
                    balance = 0;
                    start = None;
                }
            }
            _ => {}
        }
    }
    result
}

fn build_system_prompt() -> String {
    format!(
        "You translate fleet-analysis business objectives into workflow parameters. \
         Respond with a single JSON object containing the fields {} plus optional \
         priority, max_cycles and convergence_threshold. scenario_filters holds \
         environments, weather, risk_threshold and manoeuvres. Do not add prose.",
        REQUIRED_OBJECTIVE_FIELDS.join(", ")
    )
}

fn build_user_prompt(objective: &str, scene_context: Option<&str>, last_error: &str) -> String {
    let mut prompt = format!("Business objective: {objective}");
    if let Some(context) = scene_context {
        prompt.push_str(&format!("\nScene context: {context}"));
    }
    if !last_error.is_empty() {
        prompt.push_str(&format!(
            "\nYour previous response was rejected: {last_error}\nReturn only the corrected JSON object."
        ));
    }
    prompt
}
