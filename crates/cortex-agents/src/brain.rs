use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use cortex_common::{Content, Error, Message, Result, Role, Secret};
use cortex_db::ThreadStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tera::Tera;
use tracing::debug;

use crate::providers::{self, Invoke, ModelConfig, Provider, ProviderKind};
use crate::tools::Toolbox;

/// Secondary model used to turn image messages into text before the main
/// loop runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vision {
    pub model: String,
}

/// Brain definition as loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Definition {
    #[serde(flatten)]
    pub config: ModelConfig,
    /// Reserved: tool calls currently always run serially, in emission
    /// order.
    pub parallel: bool,
    pub vision: Option<Vision>,
    pub max_iterations: usize,
    /// How many stored messages a chat turn reloads.
    pub depth: usize,
    pub provider: ProviderKind,
    pub url: String,
    pub secret: Secret,
}

impl Default for Definition {
    fn default() -> Self {
        Self {
            config: ModelConfig {
                model: "gpt-4o-mini".to_string(),
                prompt: "You are the helpful assistant".to_string(),
                max_tokens: 300,
                force_json: false,
            },
            parallel: false,
            vision: None,
            max_iterations: 2,
            depth: 100,
            provider: ProviderKind::Openai,
            url: "https://api.openai.com/v1".to_string(),
            secret: Secret::from_env("OPENAI_TOKEN"),
        }
    }
}

/// Ordered provider turns accumulated over one engine call, including any
/// vision pre-pass turns.
#[derive(Debug, Default)]
pub struct Response {
    invokes: Vec<Invoke>,
}

impl Response {
    pub fn push(&mut self, invoke: Invoke) {
        self.invokes.push(invoke);
    }

    pub fn extend(&mut self, other: Response) {
        self.invokes.extend(other.invokes);
    }

    pub fn total_input_tokens(&self) -> u32 {
        self.invokes.iter().map(|inv| inv.input_tokens).sum()
    }

    pub fn total_output_tokens(&self) -> u32 {
        self.invokes.iter().map(|inv| inv.output_tokens).sum()
    }

    pub fn total_tokens(&self) -> u32 {
        self.invokes.iter().map(|inv| inv.total_tokens).sum()
    }

    /// All output messages across the turns.
    pub fn messages(&self) -> Vec<Message> {
        self.invokes
            .iter()
            .flat_map(|inv| inv.output.iter().cloned())
            .collect()
    }

    /// First assistant content, or empty text if the model never answered.
    pub fn reply(&self) -> Content {
        self.invokes
            .iter()
            .flat_map(|inv| inv.output.iter())
            .find(|msg| msg.role == Role::Assistant)
            .map(|msg| msg.content.clone())
            .unwrap_or_else(|| Content::text(""))
    }

    /// How many times a tool with the given name was called.
    pub fn called(&self, name: &str) -> usize {
        self.invokes
            .iter()
            .flat_map(|inv| inv.output.iter())
            .filter(|msg| {
                msg.role == Role::ToolCall && msg.tool_name.as_deref() == Some(name)
            })
            .count()
    }
}

impl std::ops::Deref for Response {
    type Target = [Invoke];

    fn deref(&self) -> &Self::Target {
        &self.invokes
    }
}

/// Engine failure carrying whatever turns completed before it, so callers
/// keep the accumulated token usage.
#[derive(Debug)]
pub struct EngineError {
    pub partial: Response,
    pub source: Error,
}

impl EngineError {
    fn new(partial: Response, source: Error) -> Self {
        Self { partial, source }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

type EngineResult<T> = std::result::Result<T, EngineError>;

/// The conversation engine: renders the prompt, snapshots the toolbox and
/// drives the bounded provider/tool loop. Optionally persists turns to a
/// thread store.
pub struct Brain {
    provider: Arc<dyn Provider>,
    toolbox: Arc<dyn Toolbox>,
    store: Option<Arc<dyn ThreadStore>>,
    prompt: Tera,
    config: ModelConfig,
    vision: Option<Vision>,
    iterations: usize,
    depth: usize,
}

impl Brain {
    pub fn new(
        provider: Arc<dyn Provider>,
        toolbox: Arc<dyn Toolbox>,
        config: ModelConfig,
    ) -> Result<Self> {
        let mut prompt = Tera::default();
        prompt
            .add_raw_template("prompt", &config.prompt)
            .map_err(|e| Error::Config(format!("parse prompt: {e}")))?;
        Ok(Self {
            provider,
            toolbox,
            store: None,
            prompt,
            config,
            vision: None,
            iterations: 2,
            depth: 100,
        })
    }

    pub fn with_store(mut self, store: Arc<dyn ThreadStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_vision(mut self, vision: Vision) -> Self {
        self.vision = Some(vision);
        self
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub async fn from_definition(
        definition: &Definition,
        toolbox: Arc<dyn Toolbox>,
        store: Option<Arc<dyn ThreadStore>>,
    ) -> Result<Self> {
        let secret = definition.secret.get()?;
        let provider = providers::connect(definition.provider, &definition.url, &secret).await?;
        let mut brain = Brain::new(provider, toolbox, definition.config.clone())?
            .with_iterations(definition.max_iterations)
            .with_depth(definition.depth);
        if let Some(vision) = &definition.vision {
            brain = brain.with_vision(vision.clone());
        }
        if let Some(store) = store {
            brain = brain.with_store(store);
        }
        Ok(brain)
    }

    pub async fn from_file(
        path: &Path,
        toolbox: Arc<dyn Toolbox>,
        store: Option<Arc<dyn ThreadStore>>,
    ) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("open brain file {}: {e}", path.display())))?;
        let definition: Definition = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("decode brain file: {e}")))?;
        Self::from_definition(&definition, toolbox, store).await
    }

    /// Run the loop on the given history alone, without touching any store.
    ///
    /// The iteration cap is an upper bound: the loop exits as soon as a turn
    /// emits no tool calls. When the cap is hit with calls still pending,
    /// the run ends normally and the unresolved calls stay visible in the
    /// returned response.
    pub async fn run(&self, mut history: Vec<Message>, thread: &str) -> EngineResult<Response> {
        let mut response = Response::default();

        let rendered = match self.render_prompt(&history, thread) {
            Ok(prompt) => prompt,
            Err(e) => return Err(EngineError::new(response, e)),
        };
        let mut config = self.config.clone();
        config.prompt = rendered;

        let snapshot = self.toolbox.snapshot();
        let tool_defs = snapshot.definitions();

        if let Err(e) = self.describe_images(&mut history, &mut response).await {
            return Err(EngineError::new(response, e));
        }

        debug!(
            messages = history.len(),
            tools = tool_defs.len(),
            "running model"
        );

        for _ in 0..self.iterations {
            let invoke = match self.provider.invoke(&config, &history, &tool_defs).await {
                Ok(invoke) => invoke,
                Err(e) => return Err(EngineError::new(response, e)),
            };

            let calls: Vec<Message> = invoke.tool_calls().into_iter().cloned().collect();
            let output = invoke.output.clone();
            response.push(invoke);
            if calls.is_empty() {
                break;
            }
            history.extend(output);

            for call in calls {
                let name = call.tool_name.clone().unwrap_or_default();
                let id = call.tool_id.clone().unwrap_or_default();
                let args = match parse_args(&call.content.data) {
                    Ok(args) => args,
                    Err(e) => return Err(EngineError::new(response, e)),
                };
                debug!(tool = %name, id = %id, "calling tool");
                let started = Instant::now();
                let result = match snapshot.call(&name, args).await {
                    Ok(result) => result,
                    Err(e) => return Err(EngineError::new(response, e)),
                };
                debug!(tool = %name, id = %id, duration = ?started.elapsed(), "tool call finished");
                history.push(Message::tool_result(id, name, result));
            }
        }

        Ok(response)
    }

    /// Thread-persistent variant: append the new messages, rebuild history
    /// from the store, run the loop, persist the outputs.
    pub async fn chat(&self, thread: &str, messages: Vec<Message>) -> EngineResult<Response> {
        let mut total = self.append(thread, messages).await?;

        let Some(store) = &self.store else {
            return Err(EngineError::new(
                total,
                Error::Store("no thread store configured".to_string()),
            ));
        };

        let mut stored = match store.recent(thread, self.depth).await {
            Ok(stored) => stored,
            Err(e) => return Err(EngineError::new(total, e)),
        };
        stored.reverse(); // oldest first

        // most providers require the conversation to open with a user turn
        if let Some(first_user) = stored.iter().position(|m| m.role == Role::User) {
            stored.drain(..first_user);
        }
        let history: Vec<Message> = stored.into_iter().map(|m| m.into_message()).collect();

        debug!(thread = %thread, history = history.len(), depth = self.depth, "running chat");

        let exec = match self.run(history, thread).await {
            Ok(exec) => exec,
            Err(e) => {
                total.extend(e.partial);
                return Err(EngineError::new(total, e.source));
            }
        };
        let outputs = exec.messages();
        total.extend(exec);

        match self.append(thread, outputs).await {
            Ok(saved) => total.extend(saved),
            Err(e) => {
                total.extend(e.partial);
                return Err(EngineError::new(total, e.source));
            }
        }
        Ok(total)
    }

    /// Append messages to a thread without invoking the main loop. Empty
    /// messages are dropped; the write is a single transaction.
    pub async fn append(&self, thread: &str, messages: Vec<Message>) -> EngineResult<Response> {
        let mut messages: Vec<Message> = messages
            .into_iter()
            .filter(|m| !m.content.is_empty())
            .collect();
        let mut response = Response::default();
        if messages.is_empty() {
            return Ok(response);
        }

        if let Err(e) = self.describe_images(&mut messages, &mut response).await {
            return Err(EngineError::new(response, e));
        }

        let Some(store) = &self.store else {
            return Err(EngineError::new(
                response,
                Error::Store("no thread store configured".to_string()),
            ));
        };
        if let Err(e) = store.append(thread, &messages).await {
            return Err(EngineError::new(response, e));
        }
        Ok(response)
    }

    fn render_prompt(&self, history: &[Message], thread: &str) -> Result<String> {
        let mut scope = tera::Context::new();
        scope.insert("messages", history);
        scope.insert("thread", thread);
        self.prompt
            .render("prompt", &scope)
            .map_err(|e| Error::Config(format!("render prompt: {e}")))
    }

    /// Vision pre-pass: every user image message is sent alone to the
    /// vision model and replaced in place by the textual description,
    /// re-tagged as a user message.
    async fn describe_images(
        &self,
        messages: &mut [Message],
        response: &mut Response,
    ) -> Result<()> {
        let Some(vision) = &self.vision else {
            return Ok(());
        };
        let vision_config = ModelConfig {
            model: vision.model.clone(),
            prompt: String::new(),
            max_tokens: self.config.max_tokens,
            force_json: false,
        };

        for i in 0..messages.len() {
            if messages[i].role != Role::User || !messages[i].content.mime.is_image() {
                continue;
            }
            let invoke = self
                .provider
                .invoke(&vision_config, std::slice::from_ref(&messages[i]), &[])
                .await?;
            let replacement = invoke
                .output
                .iter()
                .find(|m| m.role == Role::Assistant)
                .cloned();
            response.push(invoke);
            if let Some(mut described) = replacement {
                described.role = Role::User;
                debug!(model = %vision_config.model, index = i, "image replaced by vision description");
                messages[i] = described;
            }
        }
        Ok(())
    }
}

fn parse_args(data: &[u8]) -> Result<Value> {
    if data.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(data).map_err(|e| Error::Tool(format!("parse tool arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults() {
        let definition: Definition = serde_yaml::from_str("provider: ollama\n").unwrap();
        assert_eq!(definition.provider, ProviderKind::Ollama);
        assert_eq!(definition.max_iterations, 2);
        assert_eq!(definition.depth, 100);
        assert_eq!(definition.config.model, "gpt-4o-mini");
    }

    #[test]
    fn test_definition_full_yaml() {
        let definition: Definition = serde_yaml::from_str(
            "model: gemini-1.5-flash\nprompt: 'Hello {{ thread }}'\nmaxTokens: 300\nprovider: google\nmaxIterations: 5\nvision:\n  model: llava\nsecret:\n  fromEnv: GOOGLE_TOKEN\n",
        )
        .unwrap();
        assert_eq!(definition.provider, ProviderKind::Google);
        assert_eq!(definition.max_iterations, 5);
        assert_eq!(definition.vision.unwrap().model, "llava");
        assert_eq!(definition.secret.from_env.as_deref(), Some("GOOGLE_TOKEN"));
    }

    #[test]
    fn test_response_accumulators() {
        let mut response = Response::default();
        response.push(Invoke {
            output: vec![Message::tool_call("t1", "lookup", b"{}".to_vec())],
            input_tokens: 10,
            output_tokens: 5,
            total_tokens: 15,
        });
        response.push(Invoke {
            output: vec![Message::assistant(Content::text("answer"))],
            input_tokens: 20,
            output_tokens: 2,
            total_tokens: 22,
        });

        assert_eq!(response.total_input_tokens(), 30);
        assert_eq!(response.total_output_tokens(), 7);
        assert_eq!(response.total_tokens(), 37);
        assert_eq!(response.called("lookup"), 1);
        assert_eq!(response.called("other"), 0);
        assert_eq!(response.reply().render(), "answer");
        assert_eq!(response.messages().len(), 2);
    }

    #[test]
    fn test_empty_response_reply_is_empty_text() {
        let response = Response::default();
        assert_eq!(response.reply().render(), "");
        assert_eq!(response.total_tokens(), 0);
    }

    #[test]
    fn test_parse_args_empty_payload() {
        assert_eq!(parse_args(b"").unwrap(), serde_json::json!({}));
        assert!(parse_args(b"not json").is_err());
    }
}
