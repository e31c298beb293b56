pub mod content;
pub mod error;
pub mod message;
pub mod secret;

pub use content::{Content, Mime};
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use secret::{NamedSecret, Secret};

/// Strip parameters from a `Content-Type` header value and normalise case.
///
/// `"Application/JSON; charset=utf-8"` becomes `"application/json"`.
pub fn content_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Join non-empty parts with a separator, skipping empty strings.
pub fn concat(sep: &str, parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(sep);
        }
        out.push_str(part);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_strips_parameters() {
        assert_eq!(content_type("application/json; charset=utf-8"), "application/json");
        assert_eq!(content_type("Text/Plain"), "text/plain");
        assert_eq!(content_type(""), "");
    }

    #[test]
    fn test_concat_skips_empty() {
        assert_eq!(concat(". ", &["Summary", "Details"]), "Summary. Details");
        assert_eq!(concat("_", &["", "getPetById"]), "getPetById");
        assert_eq!(concat("_", &["petstore", "getPetById"]), "petstore_getPetById");
    }
}
