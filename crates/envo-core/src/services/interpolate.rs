use std::collections::BTreeMap;

use serde_yaml::Value;

use crate::error::{OrchestratorError, Result};

/// Ordered variable scopes; earlier scopes win.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    scopes: Vec<BTreeMap<String, String>>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a scope with lower precedence than every scope added before it.
    pub fn push_scope(&mut self, scope: BTreeMap<String, String>) {
        self.scopes.push(scope);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.scopes
            .iter()
            .find_map(|scope| scope.get(name).map(String::as_str))
    }
}

/// Expand `${name}`, `${name:-default}` and `$$` in one string.
/// `field` names the location for error messages.
pub fn interpolate(template: &str, vars: &Variables, field: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| {
                OrchestratorError::MalformedSpec(format!(
                    "{field}: unterminated variable reference in '{template}'"
                ))
            })?;
            let expr = &body[..end];
            let (name, default) = match expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (expr, None),
            };
            if !is_variable_name(name) {
                return Err(OrchestratorError::MalformedSpec(format!(
                    "{field}: invalid variable name '{name}'"
                )));
            }
            match vars.get(name).or(default) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(OrchestratorError::invalid_field(
                        field,
                        format!("variable '{name}' is not set and has no default"),
                    ))
                }
            }
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Interpolate every string scalar of a YAML tree in place. Mapping keys are left alone.
pub fn interpolate_value(value: &mut Value, vars: &Variables, path: &str) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = interpolate(s, vars, path)?;
            }
        }
        Value::Sequence(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                interpolate_value(item, vars, &format!("{path}[{i}]"))?;
            }
        }
        Value::Mapping(map) => {
            for (key, item) in map.iter_mut() {
                let key = key.as_str().unwrap_or("?");
                let child = if path.is_empty() {
                    key.to_string()
                } else {
                    format!("{path}.{key}")
                };
                interpolate_value(item, vars, &child)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, vars, path)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}
