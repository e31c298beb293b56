use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Serialize, Serializer};

use crate::error::Error;

/// Closed set of payload types the orchestrator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mime {
    Text,
    Json,
    Png,
    Jpeg,
    Jpg,
    Webp,
    Gif,
}

impl Mime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mime::Text => "text/plain",
            Mime::Json => "application/json",
            Mime::Png => "image/png",
            Mime::Jpeg => "image/jpeg",
            Mime::Jpg => "image/jpg",
            Mime::Webp => "image/webp",
            Mime::Gif => "image/gif",
        }
    }

    pub fn is_text(&self) -> bool {
        self.as_str().starts_with("text/") || *self == Mime::Json
    }

    pub fn is_image(&self) -> bool {
        self.as_str().starts_with("image/")
    }

    /// Image suffix with `jpg` normalised to `jpeg`.
    pub fn image_format(&self) -> &'static str {
        match self {
            Mime::Jpg | Mime::Jpeg => "jpeg",
            Mime::Png => "png",
            Mime::Webp => "webp",
            Mime::Gif => "gif",
            _ => "",
        }
    }
}

impl fmt::Display for Mime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mime {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text/plain" => Ok(Mime::Text),
            "application/json" => Ok(Mime::Json),
            "image/png" => Ok(Mime::Png),
            "image/jpeg" => Ok(Mime::Jpeg),
            "image/jpg" => Ok(Mime::Jpg),
            "image/webp" => Ok(Mime::Webp),
            "image/gif" => Ok(Mime::Gif),
            other => Err(Error::BadInput(format!("unsupported content type: {other}"))),
        }
    }
}

/// A single typed payload: raw bytes tagged with a MIME.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub data: Vec<u8>,
    pub mime: Mime,
}

impl Content {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            data: value.into().into_bytes(),
            mime: Mime::Text,
        }
    }

    pub fn json(data: Vec<u8>) -> Self {
        Self {
            data,
            mime: Mime::Json,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Render as a `data:` URL, used whenever binary content has to pass
    /// through a text channel.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, BASE64.encode(&self.data))
    }

    /// Textual rendering: the raw text for text-like payloads, a data URL
    /// otherwise.
    pub fn render(&self) -> String {
        if self.mime.is_text() {
            String::from_utf8_lossy(&self.data).into_owned()
        } else {
            self.data_url()
        }
    }

    /// Lenient inverse of [`Content::data_url`]. Anything that does not look
    /// like a data URL (or fails to decode) degrades to plain text.
    pub fn parse_data_url(value: &str) -> Self {
        let Some((meta, payload)) = value.split_once(',') else {
            return Content::text(value);
        };
        let mime = meta
            .strip_prefix("data:")
            .and_then(|m| m.split(';').next())
            .and_then(|m| Mime::from_str(m).ok());
        let (Some(mime), Ok(data)) = (mime, BASE64.decode(payload)) else {
            return Content::text(value);
        };
        Content { data, mime }
    }
}

impl Default for Content {
    fn default() -> Self {
        Content::text("")
    }
}

// Templates and logs see the textual rendering, not raw bytes.
impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.render())
    }
}
