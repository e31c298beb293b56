pub mod brain;
pub mod providers;
pub mod tools;

pub use brain::{Brain, Definition, EngineError, Response, Vision};
pub use providers::{connect, Invoke, ModelConfig, Provider, ProviderKind, ToolDef};
pub use tools::{DynamicToolbox, Snapshot, Tool, Toolbox};
