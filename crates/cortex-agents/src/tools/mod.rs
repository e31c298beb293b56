use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use cortex_common::{Content, Error, Result};
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::providers::ToolDef;

pub mod loader;
pub mod openapi;

/// A capability the model may call: name, description, argument schema and
/// the invocation itself.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the arguments object.
    fn input_schema(&self) -> Value;
    async fn call(&self, args: Value) -> Result<Content>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

type Handler =
    Box<dyn Fn(Value) -> BoxFuture<'static, Result<Content>> + Send + Sync>;

struct SimpleTool {
    name: String,
    description: String,
    input: Value,
    handler: Handler,
}

#[async_trait]
impl Tool for SimpleTool {
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
        (self.handler)(args).await
    }
}

/// Wrap a closure as a [`Tool`].
pub fn simple_tool<F, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    input: Value,
    handler: F,
) -> Arc<dyn Tool>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Content>> + Send + 'static,
{
    Arc::new(SimpleTool {
        name: name.into(),
        description: description.into(),
        input,
        handler: Box::new(move |args| handler(args).boxed()),
    })
}

/// Immutable name→tool view taken at the start of an engine call. Later
/// refreshes never mutate an existing snapshot.
#[derive(Default, Clone)]
pub struct Snapshot {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<ToolDef> {
        self.tools
            .values()
            .map(|tool| ToolDef {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input: tool.input_schema(),
            })
            .collect()
    }

    /// Dispatch by name.
    pub async fn call(&self, name: &str, args: Value) -> Result<Content> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| Error::ToolMissing(name.to_string()))?;
        tool.call(args).await
    }

    fn insert(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }
}

/// Anything that can produce a point-in-time tool snapshot.
pub trait Toolbox: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Refresh function of one tool source.
pub trait Refresh: Fn() -> BoxFuture<'static, Result<Vec<Arc<dyn Tool>>>> + Send + Sync {}

impl<F> Refresh for F where F: Fn() -> BoxFuture<'static, Result<Vec<Arc<dyn Tool>>>> + Send + Sync {}

impl std::fmt::Debug for dyn Refresh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshFn").finish()
    }
}

pub type RefreshFn = Box<dyn Refresh>;

/// One refreshable tool source: the refresh function plus the last good
/// tool list. The list is swapped wholesale, so readers either see the old
/// version or the new one, never a mix.
struct ToolSource {
    refresh: RefreshFn,
    state: RwLock<Option<Arc<Vec<Arc<dyn Tool>>>>>,
}

impl ToolSource {
    async fn update(&self) -> Result<()> {
        let tools = (self.refresh)().await?;
        debug!(tools = tools.len(), "tool source refreshed");
        *self.state.write().expect("tool source lock poisoned") = Some(Arc::new(tools));
        Ok(())
    }

    fn current(&self) -> Option<Arc<Vec<Arc<dyn Tool>>>> {
        self.state.read().expect("tool source lock poisoned").clone()
    }
}

/// Composite toolbox over zero or more refreshable sources. Registration
/// happens at startup; `update` may run concurrently with `snapshot` at any
/// point after.
#[derive(Default)]
pub struct DynamicToolbox {
    sources: Vec<ToolSource>,
}

impl DynamicToolbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a refreshable source. Not to be called after serving starts.
    pub fn source(&mut self, refresh: RefreshFn) {
        self.sources.push(ToolSource {
            refresh,
            state: RwLock::new(None),
        });
    }

    /// Register a fixed set of tools.
    pub fn add(&mut self, tools: Vec<Arc<dyn Tool>>) {
        if tools.is_empty() {
            return;
        }
        self.source(Box::new(move || {
            let tools = tools.clone();
            async move { Ok(tools) }.boxed()
        }));
    }

    /// Refresh all sources concurrently. Strict mode returns on the first
    /// error and abandons in-flight refreshes; otherwise every source gets
    /// to finish (successes are committed individually) and the first error
    /// is reported afterwards.
    pub async fn update(&self, strict: bool) -> Result<()> {
        if strict {
            try_join_all(self.sources.iter().map(ToolSource::update)).await?;
            return Ok(());
        }
        let results = join_all(self.sources.iter().map(ToolSource::update)).await;
        results.into_iter().find_map(|r| r.err()).map_or(Ok(()), Err)
    }
}

impl Toolbox for DynamicToolbox {
    /// Union of all source snapshots; on a name collision the source
    /// registered last wins.
    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for source in &self.sources {
            let Some(tools) = source.current() else {
                continue;
            };
            for tool in tools.iter() {
                snapshot.insert(tool.clone());
            }
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_tool(name: &str, reply: &'static str) -> Arc<dyn Tool> {
        simple_tool(
            name,
            "test tool",
            serde_json::json!({"type": "object"}),
            move |_| async move { Ok(Content::text(reply)) },
        )
    }

    #[tokio::test]
    async fn test_snapshot_dispatch() {
        let mut toolbox = DynamicToolbox::new();
        toolbox.add(vec![echo_tool("echo", "hello")]);
        toolbox.update(true).await.unwrap();

        let snapshot = toolbox.snapshot();
        assert_eq!(snapshot.len(), 1);
        let reply = snapshot.call("echo", serde_json::json!({})).await.unwrap();
        assert_eq!(reply.render(), "hello");
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let toolbox = DynamicToolbox::new();
        let err = toolbox
            .snapshot()
            .call("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolMissing(name) if name == "nope"));
    }

    #[tokio::test]
    async fn test_last_source_wins_on_collision() {
        let mut toolbox = DynamicToolbox::new();
        toolbox.add(vec![echo_tool("echo", "first")]);
        toolbox.add(vec![echo_tool("echo", "second")]);
        toolbox.update(true).await.unwrap();

        let snapshot = toolbox.snapshot();
        assert_eq!(snapshot.len(), 1);
        let reply = snapshot.call("echo", serde_json::json!({})).await.unwrap();
        assert_eq!(reply.render(), "second");
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_updates() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut toolbox = DynamicToolbox::new();
        let tick = counter.clone();
        toolbox.source(Box::new(move || {
            let n = tick.fetch_add(1, Ordering::SeqCst);
            async move { Ok(vec![echo_tool("versioned", if n == 0 { "v0" } else { "v1" })]) }
                .boxed()
        }));

        toolbox.update(true).await.unwrap();
        let before = toolbox.snapshot();
        toolbox.update(true).await.unwrap();
        let after = toolbox.snapshot();

        let old = before.call("versioned", serde_json::json!({})).await.unwrap();
        let new = after.call("versioned", serde_json::json!({})).await.unwrap();
        assert_eq!(old.render(), "v0");
        assert_eq!(new.render(), "v1");
    }

    #[tokio::test]
    async fn test_lenient_update_keeps_good_sources() {
        let mut toolbox = DynamicToolbox::new();
        toolbox.source(Box::new(|| {
            async { Err(Error::Schema("broken source".to_string())) }.boxed()
        }));
        toolbox.add(vec![echo_tool("alive", "ok")]);

        let err = toolbox.update(false).await.unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        // the healthy source was still committed
        let snapshot = toolbox.snapshot();
        assert!(snapshot.get("alive").is_some());
    }

    #[tokio::test]
    async fn test_strict_update_propagates_error() {
        let mut toolbox = DynamicToolbox::new();
        toolbox.source(Box::new(|| {
            async { Err(Error::Schema("broken source".to_string())) }.boxed()
        }));
        assert!(toolbox.update(true).await.is_err());
    }

    #[test]
    fn test_definitions_expose_schema() {
        let mut toolbox = DynamicToolbox::new();
        toolbox.add(vec![echo_tool("echo", "hello")]);
        futures::executor::block_on(toolbox.update(true)).unwrap();

        let defs = toolbox.snapshot().definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[0].input["type"], "object");
    }
}
