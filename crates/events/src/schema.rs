//! Declared event shapes.
//!
//! The registry is advisory: it decides which fields survive a publish and
//! whether an event may leave the process, but a payload that is missing a
//! declared field or carries the wrong type is only logged.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::{Map, Value};

/// JSON type a field is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldType {
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Optional fields may be absent or `null` without a warning.
    pub optional: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: true,
        }
    }
}

/// Shape and visibility of one event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventSchema {
    pub event_name: String,
    /// Declaration order is preserved.
    pub fields: Vec<FieldSpec>,
    /// Whether the stream fan-out may forward this event to observers.
    pub visible_externally: bool,
}

/// What [`EventSchema::filter`] had to adjust.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterReport {
    /// Present in the data but not declared; removed.
    pub dropped: Vec<String>,
    /// Declared as required but absent.
    pub missing: Vec<String>,
    /// Present but not of the declared type; kept.
    pub mistyped: Vec<String>,
}

impl FilterReport {
    pub fn is_clean(&self) -> bool {
        self.dropped.is_empty() && self.missing.is_empty() && self.mistyped.is_empty()
    }
}

impl EventSchema {
    pub fn new(
        event_name: impl Into<String>,
        fields: Vec<FieldSpec>,
        visible_externally: bool,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            fields,
            visible_externally,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Keep only declared fields, reporting anything that did not fit.
    pub fn filter(&self, data: &Map<String, Value>) -> (Map<String, Value>, FilterReport) {
        let mut report = FilterReport::default();
        let mut kept = Map::with_capacity(self.fields.len());

        for field in &self.fields {
            match data.get(&field.name) {
                Some(Value::Null) if field.optional => {
                    kept.insert(field.name.clone(), Value::Null);
                }
                Some(value) => {
                    if !field.ty.accepts(value) {
                        report.mistyped.push(field.name.clone());
                    }
                    kept.insert(field.name.clone(), value.clone());
                }
                None if !field.optional => report.missing.push(field.name.clone()),
                None => {}
            }
        }

        report.dropped = data
            .keys()
            .filter(|k| !self.fields.iter().any(|f| &f.name == *k))
            .cloned()
            .collect();

        (kept, report)
    }
}

/// Event names are dot-namespaced: lowercase segments of `[a-z0-9_]`
/// separated by single dots, at least two segments.
pub fn is_valid_event_name(name: &str) -> bool {
    let mut segments = 0;
    for segment in name.split('.') {
        if segment.is_empty()
            || !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return false;
        }
        segments += 1;
    }
    segments >= 2
}

/// Thread-safe map from event name to schema.
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<EventSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register or replace a schema. Returns `false` for malformed names.
    pub fn register(&self, schema: EventSchema) -> bool {
        if !is_valid_event_name(&schema.event_name) {
            tracing::warn!(event = %schema.event_name, "Refusing to register malformed event name");
            return false;
        }
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        if schemas.contains_key(&schema.event_name) {
            tracing::debug!(event = %schema.event_name, "Replacing event schema");
        }
        schemas.insert(schema.event_name.clone(), Arc::new(schema));
        true
    }

    pub fn get(&self, event_name: &str) -> Option<Arc<EventSchema>> {
        self.schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .cloned()
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.get(event_name).is_some()
    }

    /// Schemas the fan-out may forward, sorted by name.
    pub fn visible(&self) -> Vec<Arc<EventSchema>> {
        let mut visible: Vec<_> = self
            .schemas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| s.visible_externally)
            .cloned()
            .collect();
        visible.sort_by(|a, b| a.event_name.cmp(&b.event_name));
        visible
    }

    pub fn len(&self) -> usize {
        self.schemas.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn filter_drops_undeclared_and_reports_missing() {
        let schema = EventSchema::new(
            "x.y",
            vec![
                FieldSpec::required("a", FieldType::Integer),
                FieldSpec::required("b", FieldType::Integer),
                FieldSpec::required("c", FieldType::String),
            ],
            true,
        );

        let (kept, report) = schema.filter(&object(json!({"a": 1, "b": "two", "z": 3})));

        assert_eq!(Value::Object(kept), json!({"a": 1, "b": "two"}));
        assert_eq!(report.dropped, vec!["z"]);
        assert_eq!(report.missing, vec!["c"]);
        assert_eq!(report.mistyped, vec!["b"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn optional_fields_may_be_absent_or_null() {
        let schema = EventSchema::new(
            "x.y",
            vec![
                FieldSpec::optional("note", FieldType::String),
                FieldSpec::optional("extra", FieldType::Object),
            ],
            false,
        );
        let (kept, report) = schema.filter(&object(json!({"extra": null})));
        assert_eq!(Value::Object(kept), json!({"extra": null}));
        assert!(report.is_clean());
    }

    #[test]
    fn event_name_validation() {
        assert!(is_valid_event_name("generation.started"));
        assert!(is_valid_event_name("queue.job_queued"));
        assert!(is_valid_event_name("a.b.c2"));
        assert!(!is_valid_event_name("started"));
        assert!(!is_valid_event_name("generation..started"));
        assert!(!is_valid_event_name("Generation.Started"));
        assert!(!is_valid_event_name(".x"));
    }

    #[test]
    fn registry_lists_only_visible_schemas() {
        let registry = SchemaRegistry::new();
        assert!(registry.register(EventSchema::new("b.shown", vec![], true)));
        assert!(registry.register(EventSchema::new("a.hidden", vec![], false)));
        assert!(registry.register(EventSchema::new("a.shown", vec![], true)));
        assert!(!registry.register(EventSchema::new("bad", vec![], true)));

        let names: Vec<_> = registry
            .visible()
            .iter()
            .map(|s| s.event_name.clone())
            .collect();
        assert_eq!(names, vec!["a.shown", "b.shown"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn integer_type_rejects_floats() {
        assert!(FieldType::Integer.accepts(&json!(3)));
        assert!(!FieldType::Integer.accepts(&json!(3.5)));
        assert!(FieldType::Number.accepts(&json!(3.5)));
    }
}
