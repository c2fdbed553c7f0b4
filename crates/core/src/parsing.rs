//! Structured-output parsers for text generation.
//!
//! Language models wrap JSON in prose and code fences, so parsers first
//! locate the JSON candidate in the raw text and only then deserialize it.
//! A [`ParserSpec`] names a registered parser and optionally lists fields
//! the parsed object must contain.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches the body of the first fenced code block (with or without a language tag).
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fenced block regex is valid")
});

/// Names a registered parser, as carried in a text job's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserSpec {
    pub name: String,
    /// Top-level keys the parsed object must contain.
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl ParserSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_fields: Vec::new(),
        }
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("No JSON found in generated text")]
    NoStructuredData,

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Expected a JSON object")]
    NotAnObject,

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Output rejected: {0}")]
    Rejected(String),

    #[error("Unknown parser '{0}'")]
    UnknownParser(String),
}

/// Turns raw generated text into structured data.
pub trait OutputParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<serde_json::Value, ParseError>;
}

/// Accepts the first JSON object or array found in the text.
pub struct JsonParser;

impl OutputParser for JsonParser {
    fn parse(&self, raw: &str) -> Result<serde_json::Value, ParseError> {
        let candidate = extract_json(raw).ok_or(ParseError::NoStructuredData)?;
        serde_json::from_str(candidate).map_err(|e| ParseError::InvalidJson(e.to_string()))
    }
}

/// Like [`JsonParser`] but the result must be an object.
pub struct JsonObjectParser;

impl OutputParser for JsonObjectParser {
    fn parse(&self, raw: &str) -> Result<serde_json::Value, ParseError> {
        let value = JsonParser.parse(raw)?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(ParseError::NotAnObject)
        }
    }
}

/// Locate the first balanced JSON object or array in `raw`.
///
/// Prefers the contents of a fenced code block when one is present.
/// Brackets inside string literals are ignored.
pub fn extract_json(raw: &str) -> Option<&str> {
    let haystack = FENCED_BLOCK
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .filter(|body| body.contains(['{', '[']))
        .unwrap_or(raw);

    let start = haystack.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in haystack[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&haystack[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// A resolved parser plus the field requirements from its spec.
#[derive(Clone)]
pub struct BoundParser {
    name: String,
    parser: Arc<dyn OutputParser>,
    required_fields: Vec<String>,
}

impl BoundParser {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parse(&self, raw: &str) -> Result<serde_json::Value, ParseError> {
        let value = self.parser.parse(raw)?;
        if self.required_fields.is_empty() {
            return Ok(value);
        }
        let object = value.as_object().ok_or(ParseError::NotAnObject)?;
        let missing: Vec<String> = self
            .required_fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(value)
        } else {
            Err(ParseError::MissingFields(missing))
        }
    }
}

/// Named parsers available to text jobs.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn OutputParser>>,
}

impl ParserRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// A registry with `json` and `json_object` registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("json", Arc::new(JsonParser));
        registry.register("json_object", Arc::new(JsonObjectParser));
        registry
    }

    /// Register (or replace) a parser under `name`.
    pub fn register(&mut self, name: impl Into<String>, parser: Arc<dyn OutputParser>) {
        self.parsers.insert(name.into(), parser);
    }

    pub fn resolve(&self, spec: &ParserSpec) -> Result<BoundParser, ParseError> {
        let parser = self
            .parsers
            .get(&spec.name)
            .cloned()
            .ok_or_else(|| ParseError::UnknownParser(spec.name.clone()))?;
        Ok(BoundParser {
            name: spec.name.clone(),
            parser,
            required_fields: spec.required_fields.clone(),
        })
    }
}

impl fmt::Debug for BoundParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundParser")
            .field("name", &self.name)
            .field("required_fields", &self.required_fields)
            .finish_non_exhaustive()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn extracts_object_surrounded_by_prose() {
        let raw = r#"Sure! Here it is: {"name": "Goblin", "hp": 7} Hope that helps."#;
        assert_eq!(extract_json(raw), Some(r#"{"name": "Goblin", "hp": 7}"#));
    }

    #[test]
    fn prefers_fenced_block() {
        let raw = "Notes {not json}\n```json\n{\"a\": [1, 2]}\n```\n";
        assert_eq!(extract_json(raw), Some("{\"a\": [1, 2]}"));
    }

    #[test]
    fn ignores_brackets_inside_strings() {
        let raw = r#"{"text": "a } tricky { string", "n": 1} trailing"#;
        assert_eq!(
            extract_json(raw),
            Some(r#"{"text": "a } tricky { string", "n": 1}"#)
        );
    }

    #[test]
    fn unbalanced_input_yields_none() {
        assert_eq!(extract_json(r#"{"a": 1"#), None);
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn json_object_parser_rejects_arrays() {
        assert_matches!(JsonObjectParser.parse("[1, 2]"), Err(ParseError::NotAnObject));
        assert_eq!(JsonParser.parse("[1, 2]").unwrap(), json!([1, 2]));
    }

    #[test]
    fn invalid_json_is_reported() {
        assert_matches!(
            JsonParser.parse("{'single': 'quotes'}"),
            Err(ParseError::InvalidJson(_))
        );
    }

    #[test]
    fn required_fields_are_enforced() {
        let registry = ParserRegistry::with_builtins();
        let bound = registry
            .resolve(&ParserSpec::new("json").with_required_fields(["name", "hp"]))
            .unwrap();

        assert_eq!(
            bound.parse(r#"{"name": "Orc", "hp": 15}"#).unwrap(),
            json!({"name": "Orc", "hp": 15})
        );
        assert_eq!(
            bound.parse(r#"{"name": "Orc"}"#),
            Err(ParseError::MissingFields(vec!["hp".to_string()]))
        );
    }

    #[test]
    fn unknown_parser_fails_resolution() {
        let registry = ParserRegistry::with_builtins();
        assert_matches!(
            registry.resolve(&ParserSpec::new("yaml")),
            Err(ParseError::UnknownParser(name)) if name == "yaml"
        );
    }

    #[test]
    fn bound_parser_debug_names_the_parser() {
        let registry = ParserRegistry::with_builtins();
        let bound = registry.resolve(&ParserSpec::new("json")).unwrap();
        let shown = format!("{bound:?}");
        assert!(shown.starts_with("BoundParser"));
        assert!(shown.contains("\"json\""));
    }

    #[test]
    fn custom_parsers_can_be_registered() {
        struct Upper;
        impl OutputParser for Upper {
            fn parse(&self, raw: &str) -> Result<serde_json::Value, ParseError> {
                Ok(json!(raw.to_uppercase()))
            }
        }

        let mut registry = ParserRegistry::new();
        registry.register("upper", Arc::new(Upper));
        let bound = registry.resolve(&ParserSpec::new("upper")).unwrap();
        assert_eq!(bound.parse("abc").unwrap(), json!("ABC"));
        assert_eq!(bound.name(), "upper");
    }
}
