//! Conversion between document formats and canonical JSON.

use anyhow::{bail, Context};
use serde_json::{Map, Value};

use crate::model::DocumentFormat;

pub fn to_json(content: &[u8], format: DocumentFormat) -> anyhow::Result<Value> {
    match format {
        DocumentFormat::Json => serde_json::from_slice(content).context("invalid JSON"),
        DocumentFormat::Yaml => serde_yaml::from_slice(content).context("invalid YAML"),
        DocumentFormat::Toml => {
            let text = std::str::from_utf8(content).context("TOML is not UTF-8")?;
            let value: toml::Value = toml::from_str(text).context("invalid TOML")?;
            Ok(toml_to_json(value))
        }
        DocumentFormat::Ini => {
            let text = std::str::from_utf8(content).context("INI is not UTF-8")?;
            parse_ini(text)
        }
    }
}

pub fn from_json(value: &Value, format: DocumentFormat) -> anyhow::Result<Vec<u8>> {
    match format {
        DocumentFormat::Json => {
            let mut out = serde_json::to_vec_pretty(value)?;
            out.push(b'\n');
            Ok(out)
        }
        DocumentFormat::Yaml => Ok(serde_yaml::to_string(value)?.into_bytes()),
        DocumentFormat::Toml => {
            let Some(table) = json_to_toml(value) else {
                bail!("document cannot be represented as TOML");
            };
            Ok(toml::to_string_pretty(&table)?.into_bytes())
        }
        DocumentFormat::Ini => write_ini(value),
    }
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => Value::from(f),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// `None` for nulls, which TOML cannot express.
fn json_to_toml(value: &Value) -> Option<toml::Value> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(b) => toml::Value::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => toml::Value::Integer(i),
            None => toml::Value::Float(n.as_f64()?),
        },
        Value::String(s) => toml::Value::String(s.clone()),
        Value::Array(items) => toml::Value::Array(items.iter().filter_map(json_to_toml).collect()),
        Value::Object(map) => toml::Value::Table(
            map.iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k.clone(), v)))
                .collect(),
        ),
    })
}

/// `[section] key=value` becomes `{section:{key:value}}`; keys before the
/// first section stay at the root. Values are kept as strings.
fn parse_ini(text: &str) -> anyhow::Result<Value> {
    let mut root = Map::new();
    let mut section: Option<String> = None;

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            root.entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            section = Some(name);
            continue;
        }
        let Some((key, value)) = line.split_once('=').or_else(|| line.split_once(':')) else {
            bail!("line {}: expected key = value", index + 1);
        };
        let key = key.trim().to_string();
        let value = Value::String(unquote(value.trim()).to_string());

        let target = match &section {
            Some(name) => match root.get_mut(name) {
                Some(Value::Object(map)) => map,
                _ => bail!("line {}: section {name} is shadowed by a key", index + 1),
            },
            None => &mut root,
        };
        target.insert(key, value);
    }
    Ok(Value::Object(root))
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn write_ini(value: &Value) -> anyhow::Result<Vec<u8>> {
    let Value::Object(root) = value else {
        bail!("INI documents must be objects");
    };
    let mut out = String::new();
    for (key, v) in root.iter().filter(|(_, v)| !v.is_object()) {
        out.push_str(&format!("{key} = {}\n", ini_scalar(v)));
    }
    for (name, v) in root {
        let Value::Object(section) = v else { continue };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("[{name}]\n"));
        for (key, v) in section {
            out.push_str(&format!("{key} = {}\n", ini_scalar(v)));
        }
    }
    Ok(out.into_bytes())
}

fn ini_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
