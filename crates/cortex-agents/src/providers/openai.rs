use async_trait::async_trait;
use cortex_common::{Content, Error, Message, Result, Role};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Invoke, ModelConfig, Provider, ToolDef};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions adapter. Works against OpenAI proper and any
/// compatible endpoint.
pub struct OpenAi {
    client: Client,
    base_url: String,
    token: String,
}

impl OpenAi {
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
impl Provider for OpenAi {
    async fn invoke(
        &self,
        config: &ModelConfig,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<Invoke> {
        let request = convert_request(config, history, tools);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Invoke(format!("openai request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Invoke(format!("openai api error {status}: {body}")));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|e| Error::Invoke(format!("decode openai response: {e}")))?;

        Ok(convert_response(completion))
    }
}

fn convert_request(config: &ModelConfig, history: &[Message], tools: &[ToolDef]) -> WireRequest {
    let mut messages = Vec::with_capacity(1 + history.len());
    if !config.prompt.is_empty() {
        messages.push(WireMessage::System {
            content: config.prompt.clone(),
        });
    }
    for msg in history {
        messages.push(convert_message(msg));
    }

    let tools = if tools.is_empty() {
        None
    } else {
        Some(
            tools
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
        )
    };

    WireRequest {
        model: config.model.clone(),
        messages,
        max_tokens: config.max_tokens,
        response_format: config.force_json.then(|| ResponseFormat {
            kind: "json_object".to_string(),
        }),
        tools,
    }
}

fn convert_message(msg: &Message) -> WireMessage {
    match msg.role {
        Role::ToolCall => WireMessage::Assistant {
            content: None,
            tool_calls: Some(vec![WireToolCall {
                id: msg.tool_id.clone().unwrap_or_default(),
                kind: "function".to_string(),
                function: WireFunctionCall {
                    name: msg.tool_name.clone().unwrap_or_default(),
                    arguments: String::from_utf8_lossy(&msg.content.data).into_owned(),
                },
            }]),
        },
        Role::ToolResult => WireMessage::Tool {
            tool_call_id: msg.tool_id.clone().unwrap_or_default(),
            content: msg.content.render(),
        },
        Role::Assistant => WireMessage::Assistant {
            content: Some(msg.content.render()),
            tool_calls: None,
        },
        Role::User => WireMessage::User {
            content: vec![convert_part(&msg.content)],
            name: msg.user.clone(),
        },
    }
}

fn convert_part(content: &Content) -> WirePart {
    if content.mime.is_image() {
        WirePart::ImageUrl {
            image_url: WireImageUrl {
                url: content.data_url(),
            },
        }
    } else {
        WirePart::Text {
            text: content.render(),
        }
    }
}

fn convert_response(completion: Completion) -> Invoke {
    let mut output = Vec::new();
    for choice in completion.choices {
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                output.push(Message::assistant(Content::text(text)));
            }
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            output.push(Message::tool_call(
                call.id,
                call.function.name,
                call.function.arguments.into_bytes(),
            ));
        }
    }

    let usage = completion.usage.unwrap_or_default();
    Invoke {
        output,
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

// Wire types.

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum WireMessage {
    System {
        content: String,
    },
    User {
        content: Vec<WirePart>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Serialize)]
struct WireImageUrl {
    url: String,
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
    parameters: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::Mime;
    use serde_json::json;

    fn config() -> ModelConfig {
        ModelConfig {
            model: "gpt-4o-mini".to_string(),
            prompt: "Be helpful".to_string(),
            max_tokens: 300,
            force_json: false,
        }
    }

    #[test]
    fn test_system_prompt_first() {
        let history = vec![Message::user(None, Content::text("hi"))];
        let request = convert_request(&config(), &history, &[]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "Be helpful");
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn test_empty_prompt_has_no_system_block() {
        let mut cfg = config();
        cfg.prompt.clear();
        let history = vec![Message::user(None, Content::text("hi"))];
        let request = convert_request(&cfg, &history, &[]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
    }

    #[test]
    fn test_force_json_sets_response_format() {
        let mut cfg = config();
        cfg.force_json = true;
        let request = convert_request(&cfg, &[], &[]);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_tool_protocol_mapping() {
        let history = vec![
            Message::tool_call("call_1", "get_weather", b"{\"planet\":\"Venus\"}".to_vec()),
            Message::tool_result("call_1", "get_weather", Content::text("135")),
        ];
        let request = convert_request(&config(), &history, &[]);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["messages"][1]["role"], "assistant");
        assert_eq!(value["messages"][1]["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            value["messages"][1]["tool_calls"][0]["function"]["name"],
            "get_weather"
        );
        assert_eq!(value["messages"][2]["role"], "tool");
        assert_eq!(value["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(value["messages"][2]["content"], "135");
    }

    #[test]
    fn test_image_becomes_data_url_part() {
        let image = Message::user(
            None,
            Content {
                data: vec![1, 2, 3],
                mime: Mime::Png,
            },
        );
        let request = convert_request(&config(), &[image], &[]);
        let value = serde_json::to_value(&request).unwrap();
        let part = &value["messages"][1]["content"][0];
        assert_eq!(part["type"], "image_url");
        assert!(part["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_convert_response_with_tool_calls() {
        let completion: Completion = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"id\": 9}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
        .unwrap();

        let invoke = convert_response(completion);
        assert_eq!(invoke.output.len(), 1);
        assert_eq!(invoke.output[0].role, Role::ToolCall);
        assert_eq!(invoke.output[0].tool_id.as_deref(), Some("call_9"));
        assert_eq!(invoke.total_tokens, 15);
    }
}
