use std::collections::HashMap;

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use cortex_common::{content_type, Content, Error, Message, Mime, Result, Role};

pub const HEADER_ROLE: &str = "x-role";
pub const HEADER_USER: &str = "x-user";

/// Turn an inbound request into portable messages. A plain body becomes one
/// message; a `multipart/form-data` envelope becomes one message per part,
/// with per-part `X-Role`/`X-User` overrides.
pub async fn parse_request(request: Request, max_body: usize) -> Result<Vec<Message>> {
    let (parts, body) = request.into_parts();

    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();

    let base_role = parse_role(query.get("role").map(String::as_str), Role::User)?;
    let base_user = query
        .get("user")
        .cloned()
        .or_else(|| header_value(&parts.headers, "user"));

    let kind = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(content_type)
        .unwrap_or_default();

    if kind == "multipart/form-data" {
        let request = Request::from_parts(parts, body);
        return read_multipart(request, base_role, base_user).await;
    }

    let bytes = axum::body::to_bytes(body, max_body)
        .await
        .map_err(|e| Error::BadInput(format!("read body: {e}")))?;
    let content = parse_payload(&kind, bytes.to_vec())?;
    Ok(vec![Message {
        role: base_role,
        user: base_user,
        tool_name: None,
        tool_id: None,
        content,
    }])
}

async fn read_multipart(
    request: Request,
    base_role: Role,
    base_user: Option<String>,
) -> Result<Vec<Message>> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::BadInput(format!("read multipart request: {e}")))?;

    let mut out = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadInput(format!("read multipart part: {e}")))?
    {
        let role = parse_role(
            header_value(field.headers(), HEADER_ROLE).as_deref(),
            base_role,
        )?;
        let user = header_value(field.headers(), HEADER_USER).or_else(|| base_user.clone());
        let kind = field.content_type().map(content_type).unwrap_or_default();

        let data = field
            .bytes()
            .await
            .map_err(|e| Error::BadInput(format!("read part body: {e}")))?;
        out.push(Message {
            role,
            user,
            tool_name: None,
            tool_id: None,
            content: parse_payload(&kind, data.to_vec())?,
        });
    }
    Ok(out)
}

fn parse_role(value: Option<&str>, base: Role) -> Result<Role> {
    match value {
        None | Some("") => Ok(base),
        Some(value) => value.parse(),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_payload(kind: &str, data: Vec<u8>) -> Result<Content> {
    let mime = match kind {
        "" | "text/plain" => Mime::Text,
        "application/json" => Mime::Json,
        "image/png" => Mime::Png,
        "image/jpeg" => Mime::Jpeg,
        "image/jpg" => Mime::Jpg,
        "image/webp" => Mime::Webp,
        "image/gif" => Mime::Gif,
        "application/x-www-form-urlencoded" => {
            let spaced: Vec<u8> = data
                .iter()
                .map(|b| if *b == b'+' { b' ' } else { *b })
                .collect();
            let decoded = percent_encoding::percent_decode(&spaced)
                .decode_utf8()
                .map_err(|e| Error::BadInput(format!("parse form urlencoded: {e}")))?;
            return Ok(Content::text(decoded.into_owned()));
        }
        other => {
            return Err(Error::BadInput(format!("unsupported content type: {other}")));
        }
    };
    Ok(Content { data, mime })
}
