//! Parameter list mini-language
//!
//! A parameter list is free text carrying entries such as
//! `<params:steps:20>` or `<params:upscale>`; the part before the first
//! colon is the parsing key. Flags without a value read as `true`.

use log::warn;
use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::str::FromStr;

use crate::error::{NodeError, Result};

/// Parsing key used when none is given
pub const DEFAULT_PARSING_KEY: &str = "params";

/// Value returned for a missing parameter without a default
pub const MISSING_PARAMETER_DEFAULT: &str = "0";

/// How a parameter value is returned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// JSON, integer, float, boolean, then string
    #[default]
    Auto,
    /// The text as written
    String,
}

impl FromStr for ReturnType {
    type Err = NodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(ReturnType::Auto),
            "string" => Ok(ReturnType::String),
            other => Err(NodeError::invalid_input(format!(
                "Unknown return type: {}",
                other
            ))),
        }
    }
}

/// Parse every `<key:name[:value]>` entry of a parameter list
///
/// The first occurrence of a name wins. The value is everything after the
/// name, trimmed; entries without a value are `true`. Parsing stops once
/// `stop_at` has been read.
pub fn parse_parameter_list(
    list: &str,
    parsing_key: &str,
    stop_at: Option<&str>,
) -> Result<Map<String, Value>> {
    let pattern = Regex::new(&format!(r"<{}:(.+?)>", regex::escape(parsing_key)))
        .map_err(|e| NodeError::invalid_input(format!("Invalid parsing key: {}", e)))?;

    let mut params = Map::new();
    for caps in pattern.captures_iter(list) {
        let entry = &caps[1];
        let (name, value) = match entry.split_once(':') {
            Some((name, value)) => (name.trim(), Value::String(value.trim().to_string())),
            None => (entry.trim(), Value::Bool(true)),
        };
        if params.contains_key(name) {
            continue;
        }
        params.insert(name.to_string(), value);
        if stop_at == Some(name) {
            break;
        }
    }
    Ok(params)
}

/// Convert a parameter value according to the return type
pub fn auto_convert(value: &Value, return_type: ReturnType) -> Value {
    let text = match value {
        Value::String(text) => text,
        other => return other.clone(),
    };
    if return_type == ReturnType::String {
        return value.clone();
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
        return parsed;
    }
    let trimmed = text.trim();
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Some(float) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(float);
    }
    match trimmed.to_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => value.clone(),
    }
}

/// Look up a parameter, falling back to `default` (or `"0"`) when missing
pub fn parameter_or_default(
    params: &Map<String, Value>,
    name: &str,
    default: Option<&str>,
    return_type: ReturnType,
) -> Value {
    match params.get(name) {
        Some(value) => auto_convert(value, return_type),
        None => {
            warn!(
                "Did not find parameter {} in the parameter list, using the default",
                name
            );
            let fallback = default.unwrap_or(MISSING_PARAMETER_DEFAULT);
            auto_convert(&Value::String(fallback.to_string()), return_type)
        }
    }
}

/// Read one parameter from a parameter list
pub fn get_parameter_from_list(
    list: &str,
    parsing_key: &str,
    name: &str,
    return_type: ReturnType,
    default: Option<&str>,
) -> Result<Value> {
    let params = parse_parameter_list(list, parsing_key, Some(name))?;
    Ok(parameter_or_default(&params, name, default, return_type))
}

/// A parsed parameter list shared between nodes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterList {
    params: Map<String, Value>,
}

impl ParameterList {
    /// Parse a list with the given key
    pub fn parse(list: &str, parsing_key: &str) -> Result<Self> {
        Ok(Self {
            params: parse_parameter_list(list, parsing_key, None)?,
        })
    }

    pub fn get(&self, name: &str, default: Option<&str>, return_type: ReturnType) -> Value {
        parameter_or_default(&self.params, name, default, return_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// MD5 of the parsed entries in name order, changes whenever a value does
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<(&String, &Value)> = self.params.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Md5::new();
        for (name, value) in entries {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }
}
