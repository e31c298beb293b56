use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cortex_common::{Content, Error, Message, Mime, Result, Role};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Invoke, ModelConfig, Provider, ToolDef};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Gemini adapter over the REST `generateContent` endpoint.
pub struct Google {
    client: Client,
    base_url: String,
    token: String,
}

impl Google {
    pub fn new(url: &str, token: &str) -> Self {
        let base_url = if url.is_empty() { DEFAULT_BASE_URL } else { url };
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl Provider for Google {
    async fn invoke(
        &self,
        config: &ModelConfig,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<Invoke> {
        if history.is_empty() {
            return Err(Error::BadInput("no messages".to_string()));
        }
        let request = convert_request(config, history, tools)?;
        let url = format!("{}/models/{}:generateContent", self.base_url, config.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Invoke(format!("google request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Invoke(format!("google api error {status}: {body}")));
        }

        let reply: WireResponse = response
            .json()
            .await
            .map_err(|e| Error::Invoke(format!("decode google response: {e}")))?;

        convert_response(reply)
    }
}

fn convert_request(
    config: &ModelConfig,
    history: &[Message],
    tools: &[ToolDef],
) -> Result<WireRequest> {
    let mut contents = Vec::with_capacity(history.len());
    for msg in history {
        contents.push(WireContent {
            role: Some(wire_role(msg.role).to_string()),
            parts: vec![convert_part(msg)?],
        });
    }

    let function_declarations: Vec<_> = tools
        .iter()
        .map(|t| WireFunctionDecl {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: convert_schema(&t.input),
        })
        .collect();

    Ok(WireRequest {
        system_instruction: (!config.prompt.is_empty()).then(|| WireContent {
            role: None,
            parts: vec![WirePart {
                text: Some(config.prompt.clone()),
                ..Default::default()
            }],
        }),
        contents,
        tools: (!function_declarations.is_empty()).then(|| {
            vec![WireToolBlock {
                function_declarations,
            }]
        }),
        generation_config: GenerationConfig {
            max_output_tokens: config.max_tokens,
            response_mime_type: config.force_json.then(|| "application/json".to_string()),
        },
    })
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant | Role::ToolCall => "model",
        Role::User | Role::ToolResult => "user",
    }
}

fn convert_part(msg: &Message) -> Result<WirePart> {
    match msg.role {
        Role::ToolCall => {
            let args: Value = serde_json::from_slice(&msg.content.data)
                .map_err(|e| Error::Invoke(format!("decode tool call arguments: {e}")))?;
            Ok(WirePart {
                function_call: Some(WireFunctionCall {
                    name: msg.tool_name.clone().unwrap_or_default(),
                    args,
                }),
                ..Default::default()
            })
        }
        Role::ToolResult => Ok(WirePart {
            function_response: Some(WireFunctionResponse {
                name: msg.tool_name.clone().unwrap_or_default(),
                response: tool_result_object(&msg.content)?,
            }),
            ..Default::default()
        }),
        _ if msg.content.mime.is_image() => Ok(WirePart {
            inline_data: Some(WireBlob {
                mime_type: msg.content.mime.to_string(),
                data: BASE64.encode(&msg.content.data),
            }),
            ..Default::default()
        }),
        _ => Ok(WirePart {
            text: Some(msg.content.render()),
            ..Default::default()
        }),
    }
}

// Function responses must be JSON objects; everything else is wrapped under
// a "content" key.
fn tool_result_object(content: &Content) -> Result<Value> {
    match content.mime {
        Mime::Json => {
            let value: Value = serde_json::from_slice(&content.data)
                .map_err(|e| Error::Invoke(format!("decode tool result: {e}")))?;
            if value.is_object() {
                Ok(value)
            } else {
                let mut wrapped = Map::new();
                wrapped.insert("content".to_string(), value);
                Ok(Value::Object(wrapped))
            }
        }
        mime if mime.is_text() => {
            let mut wrapped = Map::new();
            wrapped.insert("content".to_string(), Value::String(content.render()));
            Ok(Value::Object(wrapped))
        }
        mime => Err(Error::Invoke(format!(
            "unsupported mime type for function response: {mime}"
        ))),
    }
}

fn convert_response(reply: WireResponse) -> Result<Invoke> {
    let usage = reply.usage_metadata.unwrap_or_default();
    let mut invoke = Invoke {
        output: Vec::new(),
        input_tokens: usage.prompt_token_count,
        output_tokens: usage.candidates_token_count + usage.cached_content_token_count,
        total_tokens: usage.total_token_count,
    };

    let Some(content) = reply
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
    else {
        return Ok(invoke);
    };

    for part in content.parts {
        if let Some(call) = part.function_call {
            let args = serde_json::to_vec(&call.args)
                .map_err(|e| Error::Invoke(format!("encode call arguments: {e}")))?;
            // Gemini omits call ids; reuse the function name.
            invoke
                .output
                .push(Message::tool_call(call.name.clone(), call.name, args));
        } else if let Some(text) = part.text {
            invoke.output.push(Message::assistant(Content::text(text)));
        } else if let Some(blob) = part.inline_data {
            let mime = Mime::from_str(&blob.mime_type)?;
            let data = BASE64
                .decode(&blob.data)
                .map_err(|e| Error::Invoke(format!("decode inline data: {e}")))?;
            invoke.output.push(Message::assistant(Content { data, mime }));
        }
    }
    Ok(invoke)
}

/// Downcast a JSON Schema into the schema dialect function declarations
/// accept (a flat subset; no refs).
fn convert_schema(input: &Value) -> WireSchema {
    let kind = match input.get("type").and_then(Value::as_str) {
        Some("object") => "OBJECT",
        Some("array") => "ARRAY",
        Some("boolean") => "BOOLEAN",
        Some("number") | Some("integer") => "NUMBER",
        Some("string") => "STRING",
        _ => "TYPE_UNSPECIFIED",
    };

    WireSchema {
        kind: kind.to_string(),
        format: input
            .get("format")
            .and_then(Value::as_str)
            .map(str::to_string),
        description: input
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        enum_values: input.get("enum").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        }),
        required: input.get("required").and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        }),
        properties: input.get("properties").and_then(Value::as_object).map(|props| {
            props
                .iter()
                .map(|(k, v)| (k.clone(), convert_schema(v)))
                .collect()
        }),
        items: input
            .get("items")
            .map(|v| Box::new(convert_schema(v))),
    }
}

// Wire types.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireToolBlock>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<WirePart>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireBlob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBlob {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    args: Value,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireToolBlock {
    function_declarations: Vec<WireFunctionDecl>,
}

#[derive(Serialize)]
struct WireFunctionDecl {
    name: String,
    description: String,
    parameters: WireSchema,
}

#[derive(Serialize)]
struct WireSchema {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(rename = "enum", skip_serializing_if = "Option::is_none")]
    enum_values: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    required: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    properties: Option<BTreeMap<String, WireSchema>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Box<WireSchema>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<WireContent>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct UsageMetadata {
    prompt_token_count: u32,
    candidates_token_count: u32,
    cached_content_token_count: u32,
    total_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ModelConfig {
        ModelConfig {
            model: "gemini-1.5-flash".to_string(),
            prompt: "Be helpful".to_string(),
            max_tokens: 300,
            force_json: false,
        }
    }

    #[test]
    fn test_roles_map_to_user_and_model() {
        let history = vec![
            Message::user(None, Content::text("hi")),
            Message::assistant(Content::text("hello")),
            Message::tool_call("lookup", "lookup", b"{}".to_vec()),
            Message::tool_result("lookup", "lookup", Content::text("135")),
        ];
        let request = convert_request(&config(), &history, &[]).unwrap();
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][1]["role"], "model");
        assert_eq!(value["contents"][2]["role"], "model");
        assert!(value["contents"][2]["parts"][0]["functionCall"].is_object());
        assert_eq!(value["contents"][3]["role"], "user");
        assert_eq!(
            value["contents"][3]["parts"][0]["functionResponse"]["response"]["content"],
            "135"
        );
    }

    #[test]
    fn test_non_object_json_result_is_wrapped() {
        let wrapped = tool_result_object(&Content::json(b"[1,2,3]".to_vec())).unwrap();
        assert_eq!(wrapped["content"], json!([1, 2, 3]));

        let object = tool_result_object(&Content::json(b"{\"id\":9}".to_vec())).unwrap();
        assert_eq!(object["id"], 9);
    }

    #[test]
    fn test_schema_conversion() {
        let schema = json!({
            "type": "object",
            "required": ["planet"],
            "properties": {
                "planet": {"type": "string", "description": "Planet name"},
                "days": {"type": "integer"}
            }
        });
        let converted = convert_schema(&schema);
        let value = serde_json::to_value(&converted).unwrap();
        assert_eq!(value["type"], "OBJECT");
        assert_eq!(value["required"][0], "planet");
        assert_eq!(value["properties"]["planet"]["type"], "STRING");
        assert_eq!(value["properties"]["days"]["type"], "NUMBER");
    }

    #[test]
    fn test_convert_response_function_call() {
        let reply: WireResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{"functionCall": {"name": "lookup", "args": {"id": 9}}}]
                }
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }))
        .unwrap();

        let invoke = convert_response(reply).unwrap();
        assert_eq!(invoke.output.len(), 1);
        assert_eq!(invoke.output[0].role, Role::ToolCall);
        assert_eq!(invoke.output[0].tool_name.as_deref(), Some("lookup"));
        assert_eq!(invoke.total_tokens, 6);
    }

    #[test]
    fn test_empty_candidates_keep_usage() {
        let reply: WireResponse = serde_json::from_value(json!({
            "usageMetadata": {"promptTokenCount": 4, "totalTokenCount": 4}
        }))
        .unwrap();
        let invoke = convert_response(reply).unwrap();
        assert!(invoke.output.is_empty());
        assert_eq!(invoke.input_tokens, 4);
    }
}
