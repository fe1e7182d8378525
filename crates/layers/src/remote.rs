//! Remote layer: forwards invocations to an HTTP endpoint.
//!
//! Wire format:
//! - request: `POST {url}` with `{"function": "...", "args": {...}}`
//! - response: `{"result": ...}` on success or `{"error": "..."}` on failure

use async_trait::async_trait;
use layerflow_config::RemoteLayerConfig;
use layerflow_core::{Error, Layer, LayerError, Value};
use std::time::Duration;
use tracing::{debug, warn};

pub struct RemoteLayer {
    name: String,
    url: String,
    description: String,
    functions: Vec<String>,
    client: reqwest::Client,
}

impl RemoteLayer {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> layerflow_core::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            description: String::new(),
            functions: Vec::new(),
            client,
        })
    }

    pub fn from_config(config: &RemoteLayerConfig) -> layerflow_core::Result<Self> {
        let mut layer = Self::new(
            &config.name,
            &config.url,
            Duration::from_secs(config.timeout_secs),
        )?;
        layer.description = config.description.clone();
        layer.functions = config.functions.clone();
        Ok(layer)
    }

    fn failed(&self, function: &str, reason: impl Into<String>) -> LayerError {
        LayerError::InvocationFailed {
            layer: self.name.clone(),
            function: function.into(),
            reason: reason.into(),
        }
    }

    /// Interpret a response body.
    fn parse_response(&self, function: &str, status: u16, body: &str) -> Result<Value, LayerError> {
        let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();

        if let Some(error) = parsed.as_ref().and_then(|json| json.get("error")) {
            let reason = match error {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Err(self.failed(function, reason));
        }

        if !(200..300).contains(&status) {
            return Err(self.failed(function, format!("HTTP {status}: {body}")));
        }

        match parsed {
            Some(serde_json::Value::Object(mut map)) => match map.remove("result") {
                Some(result) => Ok(Value::from_json(result)),
                None => Err(self.failed(function, "response has neither 'result' nor 'error'")),
            },
            _ => Err(self.failed(function, "response is not a JSON object")),
        }
    }
}

#[async_trait]
impl Layer for RemoteLayer {
    fn description(&self) -> &str {
        &self.description
    }

    fn functions(&self) -> Vec<String> {
        self.functions.clone()
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<Value, LayerError> {
        if !self.functions.is_empty() && !self.functions.iter().any(|f| f == function) {
            return Err(LayerError::UnknownFunction {
                layer: self.name.clone(),
                function: function.into(),
            });
        }

        debug!(layer = %self.name, function, url = %self.url, "Invoking remote layer");

        let body = serde_json::json!({
            "function": function,
            "args": args.to_json(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let reason = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    e.to_string()
                };
                warn!(layer = %self.name, function, error = %reason, "Remote layer unreachable");
                self.failed(function, reason)
            })?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| self.failed(function, e.to_string()))?;

        self.parse_response(function, status, &text)
    }
}
