use thiserror::Error;

/// Error kinds surfaced by the orchestrator. Each variant maps to one
/// conceptual failure class; the HTTP gateway translates them to status
/// codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed payload, unknown role or unsupported MIME from a caller.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Unusable configuration: unknown provider, bad prompt template,
    /// missing secret.
    #[error("invalid config: {0}")]
    Config(String),

    /// OpenAPI document could not be compiled into tools.
    #[error("invalid schema: {0}")]
    Schema(String),

    /// Provider transport or decode failure.
    #[error("invoke provider: {0}")]
    Invoke(String),

    /// Model asked for a tool that is not in the snapshot.
    #[error("no such tool {0:?}")]
    ToolMissing(String),

    /// Tool execution failed.
    #[error("call tool: {0}")]
    Tool(String),

    /// Upstream returned a non-2xx status.
    #[error("invalid response status code: {0}")]
    Http(u16),

    /// Response body exceeded the configured size cap.
    #[error("stream is too big (limit {0} bytes)")]
    StreamTooBig(usize),

    /// Thread store transaction failure.
    #[error("store: {0}")]
    Store(String),

    /// Deadline elapsed or the caller went away.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, Error>;
