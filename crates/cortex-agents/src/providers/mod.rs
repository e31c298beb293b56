use std::sync::Arc;

use async_trait::async_trait;
use cortex_common::{Message, Result, Role};
use serde::{Deserialize, Serialize};

pub mod bedrock;
pub mod google;
pub mod ollama;
pub mod openai;

pub use bedrock::Bedrock;
pub use google::Google;
pub use ollama::Ollama;
pub use openai::OpenAi;

/// Portable per-invocation model configuration. The engine owns loop
/// control (iteration cap, history depth); none of that leaks in here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    #[serde(rename = "forceJSON")]
    pub force_json: bool,
}

/// Tool surface shown to the model: name, description and a JSON Schema for
/// the arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    pub input: serde_json::Value,
}

/// One provider turn: emitted messages (assistant text interleaved with
/// tool calls) plus reported token usage. Zero tokens when the backend
/// does not report them.
#[derive(Debug, Clone, Default)]
pub struct Invoke {
    pub output: Vec<Message>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl Invoke {
    pub fn tool_calls(&self) -> Vec<&Message> {
        self.output
            .iter()
            .filter(|m| m.role == Role::ToolCall)
            .collect()
    }
}

/// A single LLM backend. Providers translate the portable message model
/// into their wire dialect and back; they never call tools themselves —
/// tool calls come back as messages for the engine to dispatch.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn invoke(
        &self,
        config: &ModelConfig,
        history: &[Message],
        tools: &[ToolDef],
    ) -> Result<Invoke>;
}

/// Closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Bedrock,
    Ollama,
    Google,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Google => "google",
        };
        f.write_str(name)
    }
}

/// Build a provider from its kind, endpoint URL and secret. Empty URLs fall
/// back to each vendor's public endpoint.
pub async fn connect(kind: ProviderKind, url: &str, secret: &str) -> Result<Arc<dyn Provider>> {
    match kind {
        ProviderKind::Openai => Ok(Arc::new(OpenAi::new(url, secret))),
        ProviderKind::Bedrock => Ok(Arc::new(Bedrock::new().await?)),
        ProviderKind::Ollama => Ok(Arc::new(Ollama::new(url))),
        ProviderKind::Google => Ok(Arc::new(Google::new(url, secret))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::Content;

    #[test]
    fn test_invoke_tool_calls_filter() {
        let invoke = Invoke {
            output: vec![
                Message::assistant(Content::text("thinking")),
                Message::tool_call("t1", "lookup", b"{}".to_vec()),
                Message::tool_call("t2", "lookup", b"{}".to_vec()),
            ],
            ..Default::default()
        };
        let calls = invoke.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_provider_kind_parses_lowercase() {
        let kind: ProviderKind = serde_yaml::from_str("openai").unwrap();
        assert_eq!(kind, ProviderKind::Openai);
        assert!(serde_yaml::from_str::<ProviderKind>("azure").is_err());
    }

    #[test]
    fn test_model_config_yaml_field_names() {
        let config: ModelConfig = serde_yaml::from_str(
            "model: gpt-4o-mini\nprompt: hi\nmaxTokens: 300\nforceJSON: true\n",
        )
        .unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_tokens, 300);
        assert!(config.force_json);
    }
}
