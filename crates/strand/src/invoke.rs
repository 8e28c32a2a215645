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
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| Client::builder().build().expect("HTTP client"));

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Agent invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Agent '{agent_ref}' returned status {status}: {body}")]
    BadStatus {
        agent_ref: String,
        status: u16,
        body: String,
    },
}

pub type InvokeResult<T> = Result<T, InvokeError>;

/// Invokes a named remote agent with a JSON payload and session id. The
/// response may be absent, a plain string, or well-formed JSON; callers get
/// whichever shape came back and normalise downstream.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(
        &self,
        agent_ref: &str,
        session_id: &str,
        payload: &Value,
    ) -> InvokeResult<Value>;
}

/// HTTP client for the agent invocation service. The agent reference is
/// appended to the base endpoint; the session id travels in a header so the
/// payload stays a plain object.
#[derive(Debug, Clone)]
pub struct HttpAgentInvoker {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl HttpAgentInvoker {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
        }
    }

    pub fn from_env() -> InvokeResult<Self> {
        let endpoint = std::env::var("AGENT_INVOKE_ENDPOINT").map_err(|_| {
            InvokeError::InvocationFailed("AGENT_INVOKE_ENDPOINT not set".to_string())
        })?;
        Ok(Self {
            endpoint,
            api_key: std::env::var("AGENT_INVOKE_API_KEY").ok(),
        })
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(
        &self,
        agent_ref: &str,
        session_id: &str,
        payload: &Value,
    ) -> InvokeResult<Value> {
        let url = format!("{}/{agent_ref}", self.endpoint.trim_end_matches('/'));
        debug!(agent = agent_ref, session = session_id, "Invoking agent");

        let mut request = HTTP_CLIENT
            .post(&url)
            .header("x-session-id", session_id)
            .json(payload);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InvokeError::InvocationFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InvokeError::InvocationFailed(e.to_string()))?;

        if !status.is_success() {
            return Err(InvokeError::BadStatus {
                agent_ref: agent_ref.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        info!(agent = agent_ref, bytes = body.len(), "Agent responded");

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        // A garbled body is still a response; hand it on as text for the
        // normaliser to salvage.
        match serde_json::from_str::<Value>(&body) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(body)),
        }
    }
}

/// Scripted invoker for tests and offline runs: responses are keyed by
/// agent reference and popped in order; an exhausted script degrades to an
/// absent response, the same shape a silent remote agent produces.
#[derive(Default)]
pub struct ScriptedInvoker {
    responses: std::sync::Mutex<std::collections::HashMap<String, Vec<InvokeResult<Value>>>>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, agent_ref: &str, response: InvokeResult<Value>) {
        self.responses
            .lock()
            .expect("script lock")
            .entry(agent_ref.to_string())
            .or_default()
            .push(response);
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, agent_ref: &str, _: &str, _: &Value) -> InvokeResult<Value> {
        let mut responses = self.responses.lock().expect("script lock");
        let next = responses.get_mut(agent_ref).and_then(|queue| {
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        });
        next.unwrap_or(Ok(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_invoker_pops_in_order() {
        let invoker = ScriptedInvoker::new();
        invoker.script("agent-a", Ok(Value::String("first".to_string())));
        invoker.script("agent-a", Ok(Value::String("second".to_string())));

        let payload = serde_json::json!({});
        let first = invoker.invoke("agent-a", "s", &payload).await.unwrap();
        let second = invoker.invoke("agent-a", "s", &payload).await.unwrap();
        assert_eq!(first, Value::String("first".to_string()));
        assert_eq!(second, Value::String("second".to_string()));
        // Exhausted scripts degrade to an absent response.
        let third = invoker.invoke("agent-a", "s", &payload).await.unwrap();
        assert_eq!(third, Value::Null);
    }
}
