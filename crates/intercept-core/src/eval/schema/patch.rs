//! Structural schema checks and content patching.
//!
//! Works on the `properties` / `required` / `type` subset of JSON Schema.

use serde_json::{Map, Value};

/// Required properties absent from `doc`, as dotted paths.
pub fn missing_fields(doc: &Value, schema: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk_missing(doc, schema, "", &mut out);
    out
}

fn walk_missing(doc: &Value, schema: &Value, prefix: &str, out: &mut Vec<String>) {
    let Some(obj) = doc.as_object() else { return };
    for name in required(schema) {
        if !obj.contains_key(name) {
            out.push(join(prefix, name));
        }
    }
    for (name, sub) in properties(schema) {
        if let Some(child) = obj.get(name) {
            walk_missing(child, sub, &join(prefix, name), out);
        }
    }
}

/// Keys present in `doc` but not declared under `properties`.
pub fn extra_fields(doc: &Value, schema: &Value) -> Vec<String> {
    let mut out = Vec::new();
    walk_extra(doc, schema, "", &mut out);
    out
}

fn walk_extra(doc: &Value, schema: &Value, prefix: &str, out: &mut Vec<String>) {
    let Some(obj) = doc.as_object() else { return };
    let Some(declared) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (key, child) in obj {
        match declared.get(key) {
            Some(sub) => walk_extra(child, sub, &join(prefix, key), out),
            None => out.push(join(prefix, key)),
        }
    }
}

/// Fill missing required properties and correct mistyped scalars.
///
/// Replacement values come from `const`, then `default`, then `enum[0]`,
/// then the zero value of the declared type. Returns the patched document
/// and one line per change.
pub fn patch_document(doc: &Value, schema: &Value) -> (Value, Vec<String>) {
    let mut patched = doc.clone();
    let mut changes = Vec::new();
    if patched.is_object() || doc.is_null() {
        if patched.is_null() {
            patched = Value::Object(Map::new());
        }
        patch_object(&mut patched, schema, "", &mut changes);
    }
    (patched, changes)
}

fn patch_object(doc: &mut Value, schema: &Value, prefix: &str, changes: &mut Vec<String>) {
    let required: Vec<String> = required(schema).map(str::to_string).collect();
    let Some(obj) = doc.as_object_mut() else { return };

    for (name, sub) in properties(schema) {
        let path = join(prefix, name);
        let is_required = required.iter().any(|r| r == name);
        match obj.get_mut(name) {
            None if is_required || pinned_value(sub).is_some() => {
                let mut value = replacement(sub);
                if value.is_object() {
                    patch_object(&mut value, sub, &path, changes);
                }
                obj.insert(name.to_string(), value);
                changes.push(format!("added {path}"));
            }
            None => {}
            Some(current) if current.is_object() => patch_object(current, sub, &path, changes),
            Some(current) => {
                let mismatched = !is_scalar_container(sub) && !matches_type(current, sub);
                let off_const = sub.get("const").is_some_and(|c| c != current);
                if mismatched || off_const {
                    *current = replacement(sub);
                    changes.push(format!("corrected {path}"));
                }
            }
        }
    }
}

/// `const` or `default`, the values a schema pins explicitly.
fn pinned_value(schema: &Value) -> Option<Value> {
    schema
        .get("const")
        .or_else(|| schema.get("default"))
        .cloned()
}

fn replacement(schema: &Value) -> Value {
    pinned_value(schema)
        .or_else(|| {
            schema
                .get("enum")
                .and_then(Value::as_array)
                .and_then(|e| e.first())
                .cloned()
        })
        .unwrap_or_else(|| zero_value(primary_type(schema)))
}

fn zero_value(ty: Option<&str>) -> Value {
    match ty {
        Some("string") => Value::String(String::new()),
        Some("integer") | Some("number") => Value::from(0),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("object") => Value::Object(Map::new()),
        _ => Value::Null,
    }
}

/// First non-null entry of `type`; object when only `properties` is given.
fn primary_type(schema: &Value) -> Option<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => Some(t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ if schema.get("properties").is_some() => Some("object"),
        _ => None,
    }
}

fn is_scalar_container(schema: &Value) -> bool {
    matches!(primary_type(schema), Some("array") | Some("object"))
}

pub fn matches_type(value: &Value, schema: &Value) -> bool {
    let types: Vec<&str> = match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => return true,
    };
    types.iter().any(|t| match *t {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    })
}

fn required(schema: &Value) -> impl Iterator<Item = &str> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn properties(schema: &Value) -> impl Iterator<Item = (&str, &Value)> {
    schema
        .get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v))
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["port", "db"],
            "properties": {
                "host": {"type": "string"},
                "port": {"type": "integer"},
                "mode": {"type": "string", "enum": ["fast", "safe"]},
                "tls": {"type": "boolean", "const": true},
                "db": {
                    "type": "object",
                    "required": ["name"],
                    "properties": {"name": {"type": "string", "default": "main"}}
                }
            }
        })
    }

    #[test]
    fn reports_missing_and_extra_fields() {
        let doc = json!({"host": "x", "debug": true, "db": {"user": "u"}});
        assert_eq!(missing_fields(&doc, &schema()), vec!["port", "db.name"]);
        assert_eq!(extra_fields(&doc, &schema()), vec!["db.user", "debug"]);
    }

    #[test]
    fn patches_missing_and_mistyped_values() {
        let doc = json!({"host": "x", "port": "8080", "mode": 3, "tls": false});
        let (patched, changes) = patch_document(&doc, &schema());
        assert_eq!(
            patched,
            json!({
                "host": "x",
                "port": 0,
                "mode": "fast",
                "tls": true,
                "db": {"name": "main"}
            })
        );
        assert_eq!(changes.len(), 5);
        assert!(changes.contains(&"added db.name".to_string()));
    }

    #[test]
    fn compliant_document_is_untouched() {
        let doc = json!({"port": 1, "tls": true, "db": {"name": "x"}});
        let (patched, changes) = patch_document(&doc, &schema());
        assert_eq!(patched, doc);
        assert!(changes.is_empty());
    }
}
