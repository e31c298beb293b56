use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cortex_common::{concat, content_type, Content, Error, Mime, NamedSecret, Result};
use futures::StreamExt;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use super::Tool;

mod schema;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_DEPTH: u32 = 10;

// Everything except unreserved characters, like a strict path escape.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Tool-source config: one OAS3 document compiled into one tool per
/// operation. Complex composition keywords (allOf, anyOf, ...) are not
/// supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenApiConfig {
    /// Document location; `file:` or `http(s):`.
    pub url: String,
    /// Override the API base derived from the document.
    #[serde(rename = "baseURL")]
    pub base_url: String,
    /// Per-call timeout in seconds.
    pub timeout: u64,
    /// Response body cap in bytes.
    pub max_response: usize,
    /// Extra outgoing headers, values inline or from the environment.
    pub headers: Vec<NamedSecret>,
    /// Skip operations that fail to compile instead of failing the source.
    pub ignore_invalid_operations: bool,
    /// Send `Accept: application/json` on every call.
    #[serde(rename = "acceptJSON")]
    pub accept_json: bool,
    /// Prefix tool names with `{namespace}_`.
    pub namespace: String,
    /// Keep `$defs` in the input schema instead of inlining them.
    pub keep_refs: bool,
    /// Operation IDs to skip (health checks and the like).
    pub exclude: Vec<String>,
}

/// Compile a remote OAS3 document into tools.
pub async fn load(config: OpenApiConfig) -> Result<Vec<Arc<dyn Tool>>> {
    let text = fetch_document(&config.url).await?;
    let doc = schema::parse_document(&text)?;

    let root_url = if !config.base_url.is_empty() {
        config.base_url.clone()
    } else if config.url.starts_with("file:") {
        String::new()
    } else {
        config.url.clone()
    };
    let base_url = doc.base_url(&root_url)?;

    let mut static_headers = Vec::with_capacity(config.headers.len());
    for header in &config.headers {
        let value = header
            .secret
            .get()
            .map_err(|e| Error::Config(format!("header {:?}: {e}", header.name)))?;
        static_headers.push((header.name.clone(), value));
    }

    let timeout = if config.timeout == 0 {
        DEFAULT_TIMEOUT_SECS
    } else {
        config.timeout
    };
    let max_response = if config.max_response == 0 {
        DEFAULT_LIMIT
    } else {
        config.max_response
    };
    let client = Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .map_err(|e| Error::Config(format!("build http client: {e}")))?;

    let excluded: HashSet<&str> = config.exclude.iter().map(String::as_str).collect();

    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for entry in &doc.operations {
        let op = &entry.operation;
        if excluded.contains(op.operation_id.as_str()) {
            debug!(operation = %op.operation_id, "operation excluded by config");
            continue;
        }

        let compiled = schema::tool_input(op).and_then(|input| {
            let defs = doc.dependencies(&input)?;
            Ok((input, defs))
        });
        let (mut input, defs) = match compiled {
            Ok(ok) => ok,
            Err(e) if config.ignore_invalid_operations => {
                warn!(
                    path = %entry.path,
                    method = %entry.method,
                    operation = %op.operation_id,
                    error = %e,
                    "ignoring invalid operation"
                );
                continue;
            }
            Err(e) => {
                return Err(Error::Schema(format!(
                    "create tool definition for {:?}: {e}",
                    op.operation_id
                )))
            }
        };

        if config.keep_refs {
            if !defs.is_empty() {
                if let Value::Object(map) = &mut input {
                    map.insert("$defs".to_string(), Value::Object(defs));
                }
            }
        } else {
            input = schema::flatten(&input, &defs, DEFAULT_DEPTH)
                .map_err(|e| Error::Schema(format!("flatten definition {:?}: {e}", op.operation_id)))?;
        }

        tools.push(Arc::new(RestTool {
            name: concat("_", &[&config.namespace, &op.operation_id]),
            description: concat(". ", &[&op.summary, &op.description]),
            input,
            client: client.clone(),
            method: entry.method.clone(),
            base_url: base_url.clone(),
            path_template: entry.path.clone(),
            headers: static_headers.clone(),
            accept_json: config.accept_json,
            max_response,
        }));
    }

    Ok(tools)
}

async fn fetch_document(link: &str) -> Result<String> {
    let url = Url::parse(link).map_err(|e| Error::Schema(format!("parse url: {e}")))?;

    if url.scheme() == "file" {
        let path = url
            .to_file_path()
            .map_err(|_| Error::Schema(format!("invalid file url: {link}")))?;
        return std::fs::read_to_string(&path)
            .map_err(|e| Error::Schema(format!("open file {}: {e}", path.display())));
    }

    let response = reqwest::get(url.clone())
        .await
        .map_err(|e| Error::Schema(format!("fetch document: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Schema(format!(
            "http status {} fetching {link}",
            response.status().as_u16()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| Error::Schema(format!("read document: {e}")))
}

/// The model-facing argument object for a REST tool.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolRequest {
    path: Map<String, Value>,
    query: Map<String, Value>,
    header: Map<String, Value>,
    body: Option<Value>,
}

/// One OpenAPI operation baked into a callable: pre-compiled input schema,
/// a shared HTTP client and the request recipe.
struct RestTool {
    name: String,
    description: String,
    input: Value,
    client: Client,
    method: String,
    base_url: Url,
    path_template: String,
    headers: Vec<(String, String)>,
    accept_json: bool,
    max_response: usize,
}

#[async_trait]
impl Tool for RestTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input.clone()
    }

    async fn call(&self, args: Value) -> Result<Content> {
        let request: ToolRequest = serde_json::from_value(args)
            .map_err(|e| Error::Tool(format!("parse request: {e}")))?;

        let mut path = self.path_template.clone();
        for (key, value) in &request.path {
            let escaped = utf8_percent_encode(&scalar(value), PATH_SEGMENT).to_string();
            path = path.replace(&format!("{{{key}}}"), &escaped);
        }

        let mut link = self.base_url.clone();
        let joined = format!(
            "{}/{}",
            link.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        link.set_path(&joined);
        if !request.query.is_empty() {
            let mut pairs = link.query_pairs_mut();
            for (key, value) in &request.query {
                pairs.append_pair(key, &scalar(value));
            }
        }

        let method = Method::from_bytes(self.method.to_uppercase().as_bytes())
            .map_err(|e| Error::Tool(format!("invalid method {:?}: {e}", self.method)))?;

        let mut out = self.client.request(method, link);
        for (key, value) in &self.headers {
            out = out.header(key.as_str(), value.as_str());
        }
        if self.accept_json {
            out = out.header(ACCEPT, "application/json");
        }
        for (key, value) in &request.header {
            out = out.header(key.as_str(), scalar(value));
        }
        if let Some(body) = &request.body {
            if !body.is_null() {
                let payload = serde_json::to_vec(body)
                    .map_err(|e| Error::Tool(format!("encode body: {e}")))?;
                out = out.header(CONTENT_TYPE, "application/json").body(payload);
            }
        }

        let response = out
            .send()
            .await
            .map_err(|e| Error::Tool(format!("http request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(status.as_u16()));
        }

        let reply_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(content_type)
            .unwrap_or_default();

        // Read one byte past the cap so "exactly at the limit" still
        // succeeds and only a genuine overflow fails.
        let mut data = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Tool(format!("read response body: {e}")))?;
            data.extend_from_slice(&chunk);
            if data.len() > self.max_response {
                return Err(Error::StreamTooBig(self.max_response));
            }
        }

        let mime = if reply_type.is_empty() {
            Mime::Text
        } else {
            Mime::from_str(&reply_type)?
        };
        Ok(Content { data, mime })
    }
}

// Scalars render without quotes; anything structured falls back to JSON.
fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_rendering() {
        assert_eq!(scalar(&json!("abc")), "abc");
        assert_eq!(scalar(&json!(9)), "9");
        assert_eq!(scalar(&json!(true)), "true");
    }

    #[test]
    fn test_path_escape() {
        let escaped = utf8_percent_encode("a/b c", PATH_SEGMENT).to_string();
        assert_eq!(escaped, "a%2Fb%20c");
    }

    #[test]
    fn test_tool_request_parsing_preserves_body() {
        let request: ToolRequest = serde_json::from_value(json!({
            "path": {"petId": "9"},
            "body": {"name": "rex", "tags": [1, 2]}
        }))
        .unwrap();
        assert_eq!(request.path["petId"], "9");
        assert_eq!(request.body.unwrap()["tags"][1], 2);
        assert!(request.query.is_empty());
    }
}
