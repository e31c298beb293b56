use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::content::Content;
use crate::error::Error;

/// Conversation role. `ToolCall` and `ToolResult` carry the function-calling
/// protocol between model and engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    ToolCall,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::ToolCall => "toolCall",
            Role::ToolResult => "toolResult",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "toolCall" => Ok(Role::ToolCall),
            "toolResult" => Ok(Role::ToolResult),
            other => Err(Error::BadInput(format!("invalid role: {other}"))),
        }
    }
}

/// One conversation entry.
///
/// Invariants: `ToolCall` messages carry JSON arguments in `content` plus a
/// non-empty `tool_name` and `tool_id`; `ToolResult` messages reference the
/// `tool_id` of the matching call.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub content: Content,
}

impl Message {
    pub fn user(name: impl Into<Option<String>>, content: Content) -> Self {
        Self {
            role: Role::User,
            user: name.into(),
            tool_name: None,
            tool_id: None,
            content,
        }
    }

    pub fn assistant(content: Content) -> Self {
        Self {
            role: Role::Assistant,
            user: None,
            tool_name: None,
            tool_id: None,
            content,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            role: Role::ToolCall,
            user: None,
            tool_name: Some(name.into()),
            tool_id: Some(id.into()),
            content: Content::json(args),
        }
    }

    pub fn tool_result(id: impl Into<String>, name: impl Into<String>, content: Content) -> Self {
        Self {
            role: Role::ToolResult,
            user: None,
            tool_name: Some(name.into()),
            tool_id: Some(id.into()),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::ToolCall, Role::ToolResult] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_tool_call_invariants() {
        let msg = Message::tool_call("t1", "get_weather", b"{\"planet\":\"Venus\"}".to_vec());
        assert_eq!(msg.role, Role::ToolCall);
        assert_eq!(msg.tool_id.as_deref(), Some("t1"));
        assert_eq!(msg.tool_name.as_deref(), Some("get_weather"));
        assert_eq!(msg.content.mime, crate::Mime::Json);
    }

    #[test]
    fn test_user_message_factory() {
        let msg = Message::user(Some("alice".to_string()), Content::text("hi"));
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.user.as_deref(), Some("alice"));
        assert!(msg.tool_id.is_none());
    }
}
