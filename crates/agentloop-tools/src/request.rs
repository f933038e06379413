//! `RequestTool`: a caller-declared HTTP tool, templated from the LLM's
//! arguments and executed over `reqwest` (§3, §4.9).

use std::collections::HashMap;
use std::time::Duration;

use handlebars::Handlebars;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Response bodies are truncated to this many bytes before being stored in
/// a Step's `content` (§4.9: "truncated to a bounded size, e.g., 64 KiB").
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl From<HttpMethod> for Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

/// A tool the caller describes as an HTTP request template. The LLM only
/// ever sees `name`, `description`, and `parameter_schema`; `method`,
/// `url`, `headers`, and `body` are rendered against the arguments it
/// supplies once a call is selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTool {
    pub name: String,
    pub description: String,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub parameter_schema: Value,
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Error)]
pub enum RequestToolError {
    #[error("template error rendering {field}: {source}")]
    Template {
        field: &'static str,
        #[source]
        source: handlebars::RenderError,
    },
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("invalid header value for {0:?}")]
    InvalidHeaderValue(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Outcome of executing a `RequestTool` call, pre-mapped to the
/// success/failed split §4.9 requires of the Action Executor.
#[derive(Debug, Clone)]
pub struct RequestToolOutcome {
    pub success: bool,
    pub status: Option<u16>,
    pub body: String,
    pub error: Option<String>,
}

impl RequestTool {
    /// Render `url`, `headers`, and `body` against `arguments` and perform
    /// the request, honoring `timeout_ms`. Never returns `Err` for
    /// non-2xx or transport failures — those are folded into
    /// `RequestToolOutcome` so the orchestrator can keep the loop going
    /// (§7: `ToolExecError` is not fatal).
    pub async fn execute(
        &self,
        client: &reqwest::Client,
        arguments: &serde_json::Map<String, Value>,
    ) -> Result<RequestToolOutcome, RequestToolError> {
        let handlebars = Handlebars::new();
        let context = serde_json::Value::Object(arguments.clone());

        let url = handlebars
            .render_template(&self.url, &context)
            .map_err(|source| RequestToolError::Template { field: "url", source })?;

        let body = match &self.body {
            Some(template) => Some(
                handlebars
                    .render_template(template, &context)
                    .map_err(|source| RequestToolError::Template { field: "body", source })?,
            ),
            None => None,
        };

        let mut request = client
            .request(Method::from(self.method), &url)
            .timeout(Duration::from_millis(self.timeout_ms));

        for (key, value_template) in &self.headers {
            let value = handlebars
                .render_template(value_template, &context)
                .map_err(|source| RequestToolError::Template { field: "headers", source })?;
            request = request.header(key, value);
        }

        if let Some(body) = body {
            request = request.body(body);
        }

        debug!(tool = %self.name, url = %url, "executing request tool");

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let truncated = truncate(&text);
                if status.is_success() {
                    Ok(RequestToolOutcome {
                        success: true,
                        status: Some(status.as_u16()),
                        body: truncated,
                        error: None,
                    })
                } else {
                    warn!(tool = %self.name, status = %status, "request tool returned non-2xx");
                    Ok(RequestToolOutcome {
                        success: false,
                        status: Some(status.as_u16()),
                        body: truncated,
                        error: Some(format!(
                            "{} {}",
                            status.as_u16(),
                            status.canonical_reason().unwrap_or("unknown status")
                        )),
                    })
                }
            }
            Err(err) => {
                warn!(tool = %self.name, error = %err, "request tool transport failure");
                Ok(RequestToolOutcome {
                    success: false,
                    status: None,
                    body: String::new(),
                    error: Some(err.to_string()),
                })
            }
        }
    }
}

/// Truncate to `MAX_RESPONSE_BYTES`, respecting UTF-8 char boundaries.
fn truncate(body: &str) -> String {
    if body.len() <= MAX_RESPONSE_BYTES {
        return body.to_string();
    }
    let mut end = MAX_RESPONSE_BYTES;
    while !body.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...[truncated]", &body[..end])
}
