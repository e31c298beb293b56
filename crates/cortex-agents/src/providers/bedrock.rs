use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ConversationRole, ImageBlock, ImageFormat, ImageSource, InferenceConfiguration,
    Message as WireMessage, SystemContentBlock, Tool as WireTool, ToolConfiguration,
    ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolSpecification, ToolUseBlock,
};
use aws_sdk_bedrockruntime::Client;
use aws_smithy_types::{Blob, Document, Number};
use cortex_common::{Content, Error, Message, Mime, Result, Role};
use serde_json::Value;

use super::{Invoke, ModelConfig, Provider, ToolDef};

/// AWS Bedrock adapter over the Converse API. Credentials and region come
/// from the ambient AWS environment.
pub struct Bedrock {
    client: Client,
}

impl Bedrock {
    pub async fn new() -> Result<Self> {
        let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        Ok(Self {
            client: Client::new(&config),
        })
    }
}

#[async_trait]
impl Provider for Bedrock {
    async fn invoke(
        &self,
        config: &ModelConfig,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<Invoke> {
        let mut request = self
            .client
            .converse()
            .model_id(&config.model)
            .inference_config(
                InferenceConfiguration::builder()
                    .max_tokens(config.max_tokens as i32)
                    .build(),
            );
        if !config.prompt.is_empty() {
            request = request.system(SystemContentBlock::Text(config.prompt.clone()));
        }
        for message in build_messages(history)? {
            request = request.messages(message);
        }
        if !tools.is_empty() {
            request = request.tool_config(build_tool_config(tools)?);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Invoke(format!("converse: {}", DisplayErrorContext(&e))))?;

        let mut invoke = Invoke::default();
        if let Some(usage) = response.usage() {
            invoke.input_tokens = usage.input_tokens().max(0) as u32;
            invoke.output_tokens = usage.output_tokens().max(0) as u32;
            invoke.total_tokens = usage.total_tokens().max(0) as u32;
        }

        let Some(Ok(message)) = response.output().map(|o| o.as_message()) else {
            return Ok(invoke);
        };
        for block in message.content() {
            match block {
                ContentBlock::Text(text) => {
                    invoke.output.push(Message::assistant(Content::text(text.clone())));
                }
                ContentBlock::ToolUse(tool_use) => {
                    let args = serde_json::to_vec(&document_to_json(tool_use.input()))
                        .map_err(|e| Error::Invoke(format!("encode tool input: {e}")))?;
                    invoke.output.push(Message::tool_call(
                        tool_use.tool_use_id(),
                        tool_use.name(),
                        args,
                    ));
                }
                ContentBlock::Image(image) => {
                    if let Some(ImageSource::Bytes(blob)) = image.source() {
                        invoke.output.push(Message::assistant(Content {
                            data: blob.as_ref().to_vec(),
                            mime: mime_of_format(image.format()),
                        }));
                    }
                }
                _ => {} // reasoning and guardrail blocks carry no conversation content
            }
        }
        Ok(invoke)
    }
}

/// Translate history into Converse messages. The API insists on strictly
/// alternating roles, so adjacent same-role messages are squashed into one
/// multi-block message before send.
fn build_messages(history: &[Message]) -> Result<Vec<WireMessage>> {
    let mut grouped: Vec<(ConversationRole, Vec<ContentBlock>)> = Vec::new();
    for msg in history {
        let (role, block) = match msg.role {
            Role::User => (ConversationRole::User, content_block(&msg.content)?),
            Role::Assistant => (ConversationRole::Assistant, content_block(&msg.content)?),
            Role::ToolCall => (ConversationRole::Assistant, tool_use_block(msg)?),
            Role::ToolResult => (ConversationRole::User, tool_result_block(msg)?),
        };
        match grouped.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => grouped.push((role, vec![block])),
        }
    }

    grouped
        .into_iter()
        .map(|(role, blocks)| {
            WireMessage::builder()
                .role(role)
                .set_content(Some(blocks))
                .build()
                .map_err(|e| Error::Invoke(format!("build message: {e}")))
        })
        .collect()
}

fn content_block(content: &Content) -> Result<ContentBlock> {
    if content.mime.is_image() {
        Ok(ContentBlock::Image(image_block(content)?))
    } else {
        Ok(ContentBlock::Text(content.render()))
    }
}

fn image_block(content: &Content) -> Result<ImageBlock> {
    ImageBlock::builder()
        .format(format_of_mime(content.mime))
        .source(ImageSource::Bytes(Blob::new(content.data.clone())))
        .build()
        .map_err(|e| Error::Invoke(format!("build image block: {e}")))
}

fn tool_use_block(msg: &Message) -> Result<ContentBlock> {
    let args: Value = serde_json::from_slice(&msg.content.data)
        .map_err(|e| Error::Invoke(format!("decode tool call arguments: {e}")))?;
    let block = ToolUseBlock::builder()
        .tool_use_id(msg.tool_id.clone().unwrap_or_default())
        .name(msg.tool_name.clone().unwrap_or_default())
        .input(json_to_document(&args))
        .build()
        .map_err(|e| Error::Invoke(format!("build tool use block: {e}")))?;
    Ok(ContentBlock::ToolUse(block))
}

fn tool_result_block(msg: &Message) -> Result<ContentBlock> {
    let inner = match msg.content.mime {
        Mime::Json => {
            let value: Value = serde_json::from_slice(&msg.content.data)
                .map_err(|e| Error::Invoke(format!("decode tool result: {e}")))?;
            ToolResultContentBlock::Json(json_to_document(&value))
        }
        mime if mime.is_image() => ToolResultContentBlock::Image(image_block(&msg.content)?),
        _ => ToolResultContentBlock::Text(msg.content.render()),
    };
    let block = ToolResultBlock::builder()
        .tool_use_id(msg.tool_id.clone().unwrap_or_default())
        .content(inner)
        .build()
        .map_err(|e| Error::Invoke(format!("build tool result block: {e}")))?;
    Ok(ContentBlock::ToolResult(block))
}

fn build_tool_config(tools: &[ToolDef]) -> Result<ToolConfiguration> {
    let mut builder = ToolConfiguration::builder();
    for tool in tools {
        let spec = ToolSpecification::builder()
            .name(&tool.name)
            .description(&tool.description)
            .input_schema(ToolInputSchema::Json(json_to_document(&tool.input)))
            .build()
            .map_err(|e| Error::Config(format!("build tool spec: {e}")))?;
        builder = builder.tools(WireTool::ToolSpec(spec));
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("build tool config: {e}")))
}

fn format_of_mime(mime: Mime) -> ImageFormat {
    match mime.image_format() {
        "png" => ImageFormat::Png,
        "webp" => ImageFormat::Webp,
        "gif" => ImageFormat::Gif,
        _ => ImageFormat::Jpeg,
    }
}

fn mime_of_format(format: &ImageFormat) -> Mime {
    match format {
        ImageFormat::Png => Mime::Png,
        ImageFormat::Webp => Mime::Webp,
        ImageFormat::Gif => Mime::Gif,
        _ => Mime::Jpeg,
    }
}

// The Converse SDK consumes schemas as smithy documents, not serde values;
// the two conversions below bridge losslessly for everything function
// calling cares about.
fn json_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(Number::NegInt(i))
            } else {
                Document::Number(Number::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_document(v)))
                .collect(),
        ),
    }
}

fn document_to_json(document: &Document) -> Value {
    match document {
        Document::Null => Value::Null,
        Document::Bool(b) => Value::Bool(*b),
        Document::Number(Number::PosInt(u)) => Value::from(*u),
        Document::Number(Number::NegInt(i)) => Value::from(*i),
        Document::Number(Number::Float(f)) => Value::from(*f),
        Document::String(s) => Value::String(s.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), document_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adjacent_same_role_messages_merge() {
        let history = vec![
            Message::user(None, Content::text("first")),
            Message::user(None, Content::text("second")),
            Message::assistant(Content::text("reply")),
            Message::tool_call("t1", "lookup", b"{}".to_vec()),
            Message::tool_result("t1", "lookup", Content::text("135")),
        ];
        let messages = build_messages(&history).unwrap();

        // user+user squash, assistant+toolCall squash, toolResult is user again
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role(), &ConversationRole::User);
        assert_eq!(messages[0].content().len(), 2);
        assert_eq!(messages[1].role(), &ConversationRole::Assistant);
        assert_eq!(messages[1].content().len(), 2);
        assert_eq!(messages[2].role(), &ConversationRole::User);
        assert_eq!(messages[2].content().len(), 1);
    }

    #[test]
    fn test_tool_result_json_becomes_document() {
        let msg = Message::tool_result("t1", "lookup", Content::json(b"{\"id\":9}".to_vec()));
        let block = tool_result_block(&msg).unwrap();
        let ContentBlock::ToolResult(result) = block else {
            panic!("expected tool result block");
        };
        assert_eq!(result.tool_use_id(), "t1");
        assert!(matches!(
            result.content().first(),
            Some(ToolResultContentBlock::Json(_))
        ));
    }

    #[test]
    fn test_document_round_trip() {
        let value = json!({
            "name": "pet",
            "count": 3,
            "offset": -1,
            "ratio": 0.5,
            "tags": ["a", "b"],
            "nested": {"ok": true, "missing": null}
        });
        assert_eq!(document_to_json(&json_to_document(&value)), value);
    }

    #[test]
    fn test_image_format_mapping() {
        assert_eq!(format_of_mime(Mime::Jpg), ImageFormat::Jpeg);
        assert_eq!(format_of_mime(Mime::Png), ImageFormat::Png);
        assert_eq!(mime_of_format(&ImageFormat::Gif), Mime::Gif);
    }
}
