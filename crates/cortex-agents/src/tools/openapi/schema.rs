use std::collections::{BTreeMap, HashSet};

use cortex_common::{Error, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

pub(crate) const DEFS_PREFIX: &str = "#/$defs/";
const COMPONENTS_PREFIX: &str = "#/components/schemas/";

const METHODS: [&str; 8] = [
    "get", "put", "post", "delete", "options", "head", "patch", "trace",
];

/// OAS3 document reduced to what tool compilation needs: one entry per
/// operation (with path-level parameters already pushed down) plus the
/// shared schema components, all with `#/components/schemas/` refs
/// rewritten to `#/$defs/`.
#[derive(Debug)]
pub(crate) struct Document {
    pub operations: Vec<OperationEntry>,
    pub servers: Vec<String>,
    schemas: BTreeMap<String, Value>,
}

#[derive(Debug)]
pub(crate) struct OperationEntry {
    pub path: String,
    pub method: String,
    pub operation: Operation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Operation {
    #[serde(rename = "operationId")]
    pub operation_id: String,
    pub summary: String,
    pub description: String,
    #[serde(rename = "requestBody")]
    pub request_body: Option<RequestBody>,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RequestBody {
    pub required: bool,
    pub content: BTreeMap<String, MediaType>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct MediaType {
    pub schema: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Parameter {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(rename = "in")]
    pub location: String,
    pub schema: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDocument {
    paths: BTreeMap<String, RawPathItem>,
    components: RawComponents,
    servers: Vec<RawServer>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPathItem {
    parameters: Vec<Parameter>,
    #[serde(flatten)]
    rest: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawComponents {
    schemas: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServer {
    url: String,
}

/// Parse an OAS3 document (YAML or JSON; YAML is a superset) and normalise
/// it for compilation.
pub(crate) fn parse_document(text: &str) -> Result<Document> {
    let raw: RawDocument =
        serde_yaml::from_str(text).map_err(|e| Error::Schema(format!("parse document: {e}")))?;

    let mut operations = Vec::new();
    for (path, item) in raw.paths {
        for method in METHODS {
            let Some(value) = item.rest.get(method) else {
                continue;
            };
            let mut operation: Operation = serde_yaml::from_value(value.clone())
                .map_err(|e| Error::Schema(format!("parse operation {method} {path}: {e}")))?;
            // path-level parameters apply to every operation underneath
            operation.parameters.extend(item.parameters.iter().cloned());
            for param in &mut operation.parameters {
                if let Some(schema) = &mut param.schema {
                    convert_refs(schema);
                }
            }
            if let Some(body) = &mut operation.request_body {
                for media in body.content.values_mut() {
                    if let Some(schema) = &mut media.schema {
                        convert_refs(schema);
                    }
                }
            }
            operations.push(OperationEntry {
                path: path.clone(),
                method: method.to_string(),
                operation,
            });
        }
    }

    let mut schemas = raw.components.schemas;
    for schema in schemas.values_mut() {
        convert_refs(schema);
    }

    Ok(Document {
        operations,
        servers: raw.servers.into_iter().map(|s| s.url).collect(),
        schemas,
    })
}

/// Rewrite component refs into `$defs` form, everywhere in the subtree.
fn convert_refs(node: &mut Value) {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(reference)) = map.get_mut("$ref") {
                if let Some(name) = reference.strip_prefix(COMPONENTS_PREFIX) {
                    *reference = format!("{DEFS_PREFIX}{name}");
                }
            }
            for value in map.values_mut() {
                convert_refs(value);
            }
        }
        Value::Array(items) => {
            for item in items {
                convert_refs(item);
            }
        }
        _ => {}
    }
}

impl Document {
    /// Resolve the API base. An absolute server URL wins outright; a
    /// relative one resolves against the root; an absolute root alone is
    /// enough. Query, fragment and userinfo are stripped.
    pub fn base_url(&self, root: &str) -> Result<Url> {
        let root_url = if root.is_empty() {
            None
        } else {
            Some(Url::parse(root).map_err(|e| Error::Schema(format!("parse root url: {e}")))?)
        };

        for server in &self.servers {
            if let Ok(absolute) = Url::parse(server) {
                return Ok(scrub(absolute));
            }
            if let Some(root_url) = &root_url {
                if let Ok(resolved) = root_url.join(server) {
                    return Ok(scrub(resolved));
                }
            }
        }

        match root_url {
            Some(root_url) => Ok(scrub(root_url)),
            None => Err(Error::Schema(
                "impossible to detect root API URL".to_string(),
            )),
        }
    }

    fn resolve(&self, reference: &str) -> Result<&Value> {
        let name = reference.trim_start_matches(DEFS_PREFIX);
        self.schemas
            .get(name)
            .ok_or_else(|| Error::Schema(format!("{reference:?} is not a valid ref")))
    }

    /// Collect every schema the root transitively references, keyed by
    /// definition name.
    pub fn dependencies(&self, root: &Value) -> Result<Map<String, Value>> {
        let mut defs = Map::new();
        let mut seen = HashSet::new();
        self.walk(root, &mut seen, &mut defs)?;
        Ok(defs)
    }

    fn walk(
        &self,
        node: &Value,
        seen: &mut HashSet<String>,
        defs: &mut Map<String, Value>,
    ) -> Result<()> {
        let mut refs = Vec::new();
        if let Some(reference) = node.get("$ref").and_then(Value::as_str) {
            if seen.insert(reference.to_string()) {
                refs.push(reference.to_string());
            }
        }
        if let Some(reference) = node
            .get("items")
            .and_then(|items| items.get("$ref"))
            .and_then(Value::as_str)
        {
            if seen.insert(reference.to_string()) {
                refs.push(reference.to_string());
            }
        }
        if let Some(properties) = node.get("properties").and_then(Value::as_object) {
            for value in properties.values() {
                self.walk(value, seen, defs)?;
            }
        }
        for reference in refs {
            let target = self.resolve(&reference)?.clone();
            self.walk(&target, seen, defs)?;
            defs.insert(reference.trim_start_matches(DEFS_PREFIX).to_string(), target);
        }
        Ok(())
    }
}

fn scrub(mut url: Url) -> Url {
    url.set_query(None);
    url.set_fragment(None);
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url
}

/// Build the LLM-facing input schema for one operation: an object with
/// optional `path`, `query`, `header` and `body` properties. Properties
/// without content are omitted entirely.
pub(crate) fn tool_input(op: &Operation) -> Result<Value> {
    let mut groups: BTreeMap<&str, (Map<String, Value>, Vec<Value>)> = BTreeMap::new();
    let mut seen = HashSet::new();

    for param in &op.parameters {
        if !seen.insert((param.location.clone(), param.name.clone())) {
            return Err(Error::Schema(format!(
                "duplicate parameter {:?} in {:?} of operation {:?}",
                param.name, param.location, op.operation_id
            )));
        }
        if !matches!(param.location.as_str(), "path" | "query" | "header") {
            return Err(Error::Schema(format!(
                "unknown parameter {:?} location {:?} in operation {:?}",
                param.name, param.location, op.operation_id
            )));
        }

        let mut schema = param.schema.clone().unwrap_or_else(|| Value::Object(Map::new()));
        if !param.description.is_empty() {
            let merged = match schema.get("description").and_then(Value::as_str) {
                Some(own) => format!("{}. {own}", param.description),
                None => param.description.clone(),
            };
            let trimmed = merged.trim_matches(|c: char| ". \n\t".contains(c));
            if let Value::Object(map) = &mut schema {
                map.insert("description".to_string(), Value::String(trimmed.to_string()));
            }
        }

        let location: &str = match param.location.as_str() {
            "path" => "path",
            "query" => "query",
            _ => "header",
        };
        let group = groups.entry(location).or_default();
        group.0.insert(param.name.clone(), schema);
        if param.required {
            group.1.push(Value::String(param.name.clone()));
        }
    }

    let mut properties = Map::new();
    let mut root_required = Vec::new();
    for location in ["path", "query", "header"] {
        if let Some((props, required)) = groups.remove(location) {
            let mut object = Map::new();
            object.insert("type".to_string(), Value::String("object".to_string()));
            object.insert("properties".to_string(), Value::Object(props));
            if !required.is_empty() {
                object.insert("required".to_string(), Value::Array(required));
            }
            properties.insert(location.to_string(), Value::Object(object));
        }
    }

    if let Some(body) = &op.request_body {
        let media = body.content.get("application/json").ok_or_else(|| {
            Error::Schema(format!(
                "content for operation {:?} does not support application/json",
                op.operation_id
            ))
        })?;
        let schema = media
            .schema
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()));
        properties.insert("body".to_string(), schema);
        if body.required {
            root_required.push(Value::String("body".to_string()));
        }
    }

    let mut root = Map::new();
    root.insert("type".to_string(), Value::String("object".to_string()));
    root.insert("properties".to_string(), Value::Object(properties));
    if !root_required.is_empty() {
        root.insert("required".to_string(), Value::Array(root_required));
    }
    Ok(Value::Object(root))
}

/// Inline every `$ref` using the collected definitions. Each inline step
/// consumes one level of `depth`, which bounds cyclic schemas.
pub(crate) fn flatten(node: &Value, defs: &Map<String, Value>, depth: u32) -> Result<Value> {
    if depth == 0 {
        return Err(Error::Schema("schema is nested too deep to flatten".to_string()));
    }
    match node {
        Value::Object(map) => {
            if let Some(reference) = map.get("$ref").and_then(Value::as_str) {
                let name = reference.trim_start_matches(DEFS_PREFIX);
                let target = defs
                    .get(name)
                    .ok_or_else(|| Error::Schema(format!("{reference:?} is not a valid ref")))?;
                return flatten(target, defs, depth - 1);
            }
            let mut out = Map::new();
            for (key, value) in map {
                out.insert(key.clone(), flatten(value, defs, depth)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(flatten(item, defs, depth)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PETSTORE: &str = r#"
openapi: 3.0.2
servers:
  - url: /api/v3
paths:
  /pet/{petId}:
    parameters:
      - name: verbose
        in: query
        schema:
          type: boolean
    get:
      operationId: getPetById
      summary: Find pet by ID
      description: Returns a single pet
      parameters:
        - name: petId
          in: path
          required: true
          description: ID of pet to return
          schema:
            type: integer
            format: int64
    post:
      operationId: updatePet
      requestBody:
        required: true
        content:
          application/json:
            schema:
              $ref: '#/components/schemas/Pet'
components:
  schemas:
    Pet:
      type: object
      required:
        - name
      properties:
        name:
          type: string
        category:
          $ref: '#/components/schemas/Category'
    Category:
      type: object
      properties:
        name:
          type: string
"#;

    #[test]
    fn test_parse_propagates_path_parameters() {
        let doc = parse_document(PETSTORE).unwrap();
        let get = doc
            .operations
            .iter()
            .find(|entry| entry.operation.operation_id == "getPetById")
            .unwrap();
        assert_eq!(get.method, "get");
        assert_eq!(get.path, "/pet/{petId}");
        // own parameter plus the propagated path-level one
        assert_eq!(get.operation.parameters.len(), 2);
        assert!(get
            .operation
            .parameters
            .iter()
            .any(|p| p.name == "verbose" && p.location == "query"));
    }

    #[test]
    fn test_refs_are_rewritten_to_defs() {
        let doc = parse_document(PETSTORE).unwrap();
        let post = doc
            .operations
            .iter()
            .find(|entry| entry.operation.operation_id == "updatePet")
            .unwrap();
        let body = post.operation.request_body.as_ref().unwrap();
        let schema = body.content["application/json"].schema.as_ref().unwrap();
        assert_eq!(schema["$ref"], "#/$defs/Pet");
    }

    #[test]
    fn test_tool_input_shape() {
        let doc = parse_document(PETSTORE).unwrap();
        let get = doc
            .operations
            .iter()
            .find(|entry| entry.operation.operation_id == "getPetById")
            .unwrap();
        let input = tool_input(&get.operation).unwrap();

        assert_eq!(input["type"], "object");
        assert_eq!(input["properties"]["path"]["properties"]["petId"]["type"], "integer");
        assert_eq!(input["properties"]["path"]["required"][0], "petId");
        assert_eq!(
            input["properties"]["query"]["properties"]["verbose"]["type"],
            "boolean"
        );
        // no headers and no body on this operation
        assert!(input["properties"].get("header").is_none());
        assert!(input["properties"].get("body").is_none());
        assert!(input.get("required").is_none());
    }

    #[test]
    fn test_body_schema_and_requirement() {
        let doc = parse_document(PETSTORE).unwrap();
        let post = doc
            .operations
            .iter()
            .find(|entry| entry.operation.operation_id == "updatePet")
            .unwrap();
        let input = tool_input(&post.operation).unwrap();
        assert_eq!(input["properties"]["body"]["$ref"], "#/$defs/Pet");
        assert_eq!(input["required"][0], "body");
    }

    #[test]
    fn test_duplicate_parameter_fails() {
        let op = Operation {
            operation_id: "dup".to_string(),
            parameters: vec![
                Parameter {
                    name: "id".to_string(),
                    location: "query".to_string(),
                    ..Default::default()
                },
                Parameter {
                    name: "id".to_string(),
                    location: "query".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert!(matches!(tool_input(&op), Err(Error::Schema(_))));
    }

    #[test]
    fn test_unknown_location_fails() {
        let op = Operation {
            operation_id: "bad".to_string(),
            parameters: vec![Parameter {
                name: "token".to_string(),
                location: "cookie".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(tool_input(&op), Err(Error::Schema(_))));
    }

    #[test]
    fn test_non_json_body_fails() {
        let mut content = BTreeMap::new();
        content.insert("application/xml".to_string(), MediaType::default());
        let op = Operation {
            operation_id: "xmlOnly".to_string(),
            request_body: Some(RequestBody {
                required: true,
                content,
            }),
            ..Default::default()
        };
        assert!(matches!(tool_input(&op), Err(Error::Schema(_))));
    }

    #[test]
    fn test_dependencies_are_transitive() {
        let doc = parse_document(PETSTORE).unwrap();
        let root = json!({"properties": {"body": {"$ref": "#/$defs/Pet"}}});
        let defs = doc.dependencies(&root).unwrap();
        assert!(defs.contains_key("Pet"));
        assert!(defs.contains_key("Category"));
    }

    #[test]
    fn test_flatten_inlines_refs() {
        let doc = parse_document(PETSTORE).unwrap();
        let root = json!({
            "type": "object",
            "properties": {"body": {"$ref": "#/$defs/Pet"}}
        });
        let defs = doc.dependencies(&root).unwrap();
        let flat = flatten(&root, &defs, 10).unwrap();
        assert_eq!(flat["properties"]["body"]["type"], "object");
        assert_eq!(
            flat["properties"]["body"]["properties"]["category"]["properties"]["name"]["type"],
            "string"
        );
    }

    #[test]
    fn test_flatten_bounds_cycles() {
        let mut defs = Map::new();
        defs.insert("Node".to_string(), json!({"$ref": "#/$defs/Node"}));
        let root = json!({"$ref": "#/$defs/Node"});
        assert!(matches!(flatten(&root, &defs, 10), Err(Error::Schema(_))));
    }

    #[test]
    fn test_unresolved_ref_fails() {
        let doc = parse_document(PETSTORE).unwrap();
        let root = json!({"$ref": "#/$defs/Missing"});
        assert!(doc.dependencies(&root).is_err());
    }

    #[test]
    fn test_base_url_resolution() {
        let doc = parse_document(PETSTORE).unwrap();
        // relative server resolves against an absolute root
        let base = doc.base_url("https://petstore.example.com/openapi.json").unwrap();
        assert_eq!(base.as_str(), "https://petstore.example.com/api/v3");
        // no root at all (file source) and only a relative server
        assert!(doc.base_url("").is_err());
    }

    #[test]
    fn test_absolute_server_wins() {
        let doc = Document {
            operations: Vec::new(),
            servers: vec!["https://api.example.com/v1?key=x#frag".to_string()],
            schemas: BTreeMap::new(),
        };
        let base = doc.base_url("https://other.example.com").unwrap();
        assert_eq!(base.as_str(), "https://api.example.com/v1");
    }

    #[test]
    fn test_root_alone_is_enough() {
        let doc = Document {
            operations: Vec::new(),
            servers: Vec::new(),
            schemas: BTreeMap::new(),
        };
        let base = doc.base_url("https://user:pw@example.com/api?x=1").unwrap();
        assert_eq!(base.as_str(), "https://example.com/api");
    }
}
