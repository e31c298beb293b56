use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cortex_common::{Content, Error, Message, Mime, Result, Role};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Invoke, ModelConfig, Provider, ToolDef};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Adapter for a local or remote Ollama daemon (`/api/chat`).
pub struct Ollama {
    client: Client,
    base_url: String,
}

impl Ollama {
    pub fn new(url: &str) -> Self {
        let base_url = if url.is_empty() { DEFAULT_BASE_URL } else { url };
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Provider for Ollama {
    async fn invoke(
        &self,
        config: &ModelConfig,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<Invoke> {
        let request = convert_request(config, history, tools)?;
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Invoke(format!("ollama request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Invoke(format!("ollama api error {status}: {body}")));
        }

        // The daemon replies with newline-delimited frames when streaming and
        // a single frame otherwise; both parse the same way.
        let body = response
            .text()
            .await
            .map_err(|e| Error::Invoke(format!("read ollama response: {e}")))?;
        let mut frames = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let frame: Frame = serde_json::from_str(line)
                .map_err(|e| Error::Invoke(format!("decode ollama frame: {e}")))?;
            frames.push(frame);
        }

        convert_response(frames)
    }
}

fn convert_request(
    config: &ModelConfig,
    history: &[Message],
    tools: &[ToolDef],
) -> Result<WireRequest> {
    let mut messages = Vec::with_capacity(1 + history.len());
    if !config.prompt.is_empty() {
        messages.push(WireMessage {
            role: "system".to_string(),
            content: Some(config.prompt.clone()),
            images: Vec::new(),
            tool_calls: Vec::new(),
        });
    }
    for msg in history {
        messages.push(convert_message(msg)?);
    }

    Ok(WireRequest {
        model: config.model.clone(),
        messages,
        stream: false,
        format: config.force_json.then(|| "json".to_string()),
        tools: tools
            .iter()
            .map(|t| WireTool {
                kind: "function".to_string(),
                function: WireFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input.clone(),
                },
            })
            .collect(),
        options: Options {
            num_predict: config.max_tokens,
        },
    })
}

fn convert_message(msg: &Message) -> Result<WireMessage> {
    match msg.role {
        Role::ToolCall => {
            let arguments: Value = serde_json::from_slice(&msg.content.data)
                .map_err(|e| Error::Invoke(format!("decode tool call arguments: {e}")))?;
            Ok(WireMessage {
                role: "assistant".to_string(),
                content: None,
                images: Vec::new(),
                tool_calls: vec![WireToolCall {
                    function: WireFunctionCall {
                        name: msg.tool_name.clone().unwrap_or_default(),
                        arguments,
                    },
                }],
            })
        }
        role => {
            let wire_role = match role {
                Role::Assistant => "assistant",
                Role::ToolResult => "tool",
                _ => "user",
            };
            let mut out = WireMessage {
                role: wire_role.to_string(),
                content: None,
                images: Vec::new(),
                tool_calls: Vec::new(),
            };
            if msg.content.mime.is_image() {
                out.images.push(BASE64.encode(&msg.content.data));
            } else {
                out.content = Some(msg.content.render());
            }
            Ok(out)
        }
    }
}

fn convert_response(frames: Vec<Frame>) -> Result<Invoke> {
    let mut invoke = Invoke::default();
    for frame in frames {
        invoke.input_tokens += frame.prompt_eval_count;
        invoke.output_tokens += frame.eval_count;

        let Some(message) = frame.message else {
            continue;
        };
        for image in message.images {
            let data = BASE64
                .decode(&image)
                .map_err(|e| Error::Invoke(format!("decode ollama image: {e}")))?;
            invoke.output.push(Message::assistant(Content {
                data,
                mime: Mime::Jpg,
            }));
        }
        if let Some(text) = message.content {
            if !text.is_empty() {
                invoke.output.push(Message::assistant(Content::text(text)));
            }
        }
        for call in message.tool_calls {
            let args = serde_json::to_vec(&call.function.arguments)
                .map_err(|e| Error::Invoke(format!("encode tool call arguments: {e}")))?;
            // Ollama has no call ids; the function name doubles as one.
            invoke
                .output
                .push(Message::tool_call(call.function.name.clone(), call.function.name, args));
        }
    }
    invoke.total_tokens = invoke.input_tokens + invoke.output_tokens;
    Ok(invoke)
}

// Wire types.

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    options: Options,
}

#[derive(Serialize)]
struct Options {
    num_predict: u32,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: Value,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionDef,
}

#[derive(Serialize)]
struct WireFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct Frame {
    message: Option<FrameMessage>,
    #[serde(default)]
    prompt_eval_count: u32,
    #[serde(default)]
    eval_count: u32,
}

#[derive(Deserialize)]
struct FrameMessage {
    content: Option<String>,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}
