use anyhow::anyhow;
use jsonschema::Draft;
use serde_json::Value;

use super::patch::{extra_fields, missing_fields, patch_document};
use super::SchemaEngine;

/// Upper bound on validator messages collected per document.
const MAX_ERRORS: usize = 100;

/// [`SchemaEngine`] backed by the `jsonschema` crate (draft 2020-12).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSchemaEngine;

impl SchemaEngine for JsonSchemaEngine {
    fn validate(&self, doc: &Value, schema: &Value, strict: bool) -> anyhow::Result<Vec<String>> {
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(schema)
            .map_err(|e| anyhow!("invalid schema: {e}"))?;

        let mut issues: Vec<String> = missing_fields(doc, schema)
            .into_iter()
            .map(|f| format!("Missing required field: {f}"))
            .collect();

        if strict {
            issues.extend(
                extra_fields(doc, schema)
                    .into_iter()
                    .map(|f| format!("Extra field not defined in schema: {f}")),
            );
        }

        // Required-property failures are already reported by path above.
        issues.extend(
            validator
                .iter_errors(doc)
                .take(MAX_ERRORS)
                .map(|e| e.to_string())
                .filter(|m| !m.ends_with("is a required property")),
        );
        Ok(issues)
    }

    fn patch(&self, doc: &Value, schema: &Value) -> anyhow::Result<(Value, Vec<String>)> {
        Ok(patch_document(doc, schema))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["port"],
            "properties": {
                "host": {"type": "string"},
                "port": {"type": "integer", "minimum": 1}
            }
        })
    }

    #[test]
    fn missing_field_reported_once() {
        let issues = JsonSchemaEngine
            .validate(&json!({"host": "x"}), &schema(), false)
            .unwrap();
        assert_eq!(issues, vec!["Missing required field: port"]);
    }

    #[test]
    fn strict_mode_flags_extra_fields() {
        let doc = json!({"host": "x", "port": 80, "debug": true});
        assert!(JsonSchemaEngine.validate(&doc, &schema(), false).unwrap().is_empty());
        let issues = JsonSchemaEngine.validate(&doc, &schema(), true).unwrap();
        assert_eq!(issues, vec!["Extra field not defined in schema: debug"]);
    }

    #[test]
    fn constraint_violations_use_validator_messages() {
        let issues = JsonSchemaEngine
            .validate(&json!({"port": 0}), &schema(), false)
            .unwrap();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("minimum"), "{issues:?}");
    }

    #[test]
    fn invalid_schema_is_an_error() {
        let bad = json!({"type": 12});
        assert!(JsonSchemaEngine.validate(&json!({}), &bad, false).is_err());
    }
}
