//! `{{NAME}}` variable substitution
//!
//! Variables come from the store's variable table, loaded fresh for every
//! request. Stored values are base64-obfuscated at rest; `env` sources are
//! read from the process environment at lookup time. Unknown names are left
//! in place literally.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use serde_json::{Number, Value};

use crate::Result;
use crate::model::{Variable, VariableSource, VariableType};
use crate::store::Store;

fn token_re() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    TOKEN_RE.get_or_init(|| Regex::new(r"\{\{([A-Z0-9_]+)\}\}").unwrap())
}

fn whole_token_re() -> &'static Regex {
    static WHOLE_RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    WHOLE_RE.get_or_init(|| Regex::new(r"^\{\{([A-Z0-9_]+)\}\}$").unwrap())
}

/// Whether `name` is a legal variable name (`[A-Z0-9_]+`).
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Obfuscate a plain value for storage.
#[must_use]
pub fn obfuscate(plain: &str) -> String {
    STANDARD.encode(plain)
}

fn reveal(stored: &str) -> String {
    STANDARD
        .decode(stored)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| stored.to_string())
}

/// Resolver over one snapshot of the variable table.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    variables: HashMap<String, (VariableSource, VariableType)>,
}

impl VariableResolver {
    /// Build from a list of variables.
    #[must_use]
    pub fn new(variables: Vec<Variable>) -> Self {
        Self {
            variables: variables
                .into_iter()
                .map(|v| (v.name, (v.source, v.kind)))
                .collect(),
        }
    }

    /// Load the current variable table from the store.
    pub async fn load(store: &dyn Store) -> Result<Self> {
        Ok(Self::new(store.variables().await?))
    }

    /// Text value of a variable, if it resolves.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        let (source, _) = self.variables.get(name)?;
        match source {
            VariableSource::Value(stored) => Some(reveal(stored)),
            VariableSource::Env(var) => std::env::var(var).ok(),
        }
    }

    /// Typed value of a variable: numbers become JSON numbers when they parse.
    #[must_use]
    pub fn lookup_typed(&self, name: &str) -> Option<Value> {
        let text = self.lookup(name)?;
        let (_, kind) = self.variables.get(name)?;
        if *kind == VariableType::Number {
            if let Ok(int) = text.trim().parse::<i64>() {
                return Some(Value::Number(int.into()));
            }
            if let Some(float) = text.trim().parse::<f64>().ok().and_then(Number::from_f64) {
                return Some(Value::Number(float));
            }
        }
        Some(Value::String(text))
    }

    /// Replace every known `{{NAME}}` with its text value.
    #[must_use]
    pub fn resolve_string(&self, input: &str) -> String {
        token_re()
            .replace_all(input, |caps: &regex::Captures| {
                self.lookup(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Resolve every string leaf of a JSON value as text.
    #[must_use]
    pub fn resolve_structured(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_string(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_structured(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_structured(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve every value of a string map.
    #[must_use]
    pub fn resolve_map(&self, map: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve_string(v)))
            .collect()
    }

    /// Resolve string leaves, keeping the variable's type when a leaf is
    /// exactly one token.
    #[must_use]
    pub fn resolve_typed(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => whole_token_re()
                .captures(s)
                .and_then(|caps| self.lookup_typed(&caps[1]))
                .unwrap_or_else(|| Value::String(self.resolve_string(s))),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_typed(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_typed(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Parse a JSON document and resolve it type-preservingly. A document
    /// that only becomes JSON after substitution (`{"max": {{MAX}}}`) is
    /// parsed from the substituted text; anything else is resolved as a
    /// plain string.
    #[must_use]
    pub fn resolve_json_preserving_types(&self, document: &str) -> Value {
        if let Ok(parsed) = serde_json::from_str::<Value>(document) {
            return self.resolve_typed(&parsed);
        }
        let substituted = self.resolve_string(document);
        match serde_json::from_str::<Value>(&substituted) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(substituted),
        }
    }

    /// Names referenced in `input` that do not resolve, in order of first use.
    #[must_use]
    pub fn unresolved_names(&self, input: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in token_re().captures_iter(input) {
            let name = &caps[1];
            if self.lookup(name).is_none() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}
