use std::path::Path;

use cortex_common::{Error, Result};
use futures::FutureExt;
use serde::Deserialize;

use super::openapi::{self, OpenApiConfig};
use super::RefreshFn;

/// Load a multi-document YAML tool file. Each document describes one
/// refreshable tool source:
///
/// ```yaml
/// type: openapi
/// url: https://petstore3.swagger.io/api/v3/openapi.json
/// acceptJSON: true
/// ---
/// type: openapi
/// url: file:///etc/cortex/internal.yaml
/// ```
pub fn load_file(path: &Path) -> Result<Vec<RefreshFn>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("open tool file {}: {e}", path.display())))?;
    decode(&text)
}

pub fn decode(src: &str) -> Result<Vec<RefreshFn>> {
    let mut out: Vec<RefreshFn> = Vec::new();
    for document in serde_yaml::Deserializer::from_str(src) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| Error::Config(format!("decode tool document: {e}")))?;
        let kind = value
            .get("type")
            .and_then(serde_yaml::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "openapi" => {
                let config: OpenApiConfig = serde_yaml::from_value(value)
                    .map_err(|e| Error::Config(format!("decode openapi config: {e}")))?;
                out.push(Box::new(move || {
                    let config = config.clone();
                    async move { openapi::load(config).await }.boxed()
                }));
            }
            other => return Err(Error::Config(format!("unknown tool type: {other}"))),
        }
    }
    Ok(out)
}
