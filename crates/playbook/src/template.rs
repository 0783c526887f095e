// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Template rendering over the Jinja-style mini-language.
//!
//! Thin wrapper around `minijinja`: lenient undefined handling, expression
//! truthiness for `when`/`retry_when`/`continue_while`, and deep rendering
//! of JSON payloads. A string that is exactly one `{{ expr }}` renders to
//! the expression's native JSON type instead of a string.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template render failed: {0}")]
    Render(#[from] minijinja::Error),
    #[error("rendered value is not valid JSON: {0}")]
    Convert(#[from] serde_json::Error),
}

/// Shared template environment.
pub struct Templates {
    env: Environment<'static>,
}

impl Templates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Missing variables render empty rather than erroring; `truthy`
        // on an undefined path is false, never a failure.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        Self { env }
    }

    /// Render a template string against the context.
    pub fn render_str(&self, template: &str, ctx: &Value) -> Result<String, TemplateError> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        let ctx = minijinja::Value::from_serialize(ctx);
        Ok(self.env.render_str(template, ctx)?)
    }

    /// Evaluate an expression (with or without `{{ }}` wrapping) to a
    /// native JSON value.
    pub fn eval(&self, expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
        let inner = strip_braces(expr);
        let compiled = self.env.compile_expression(inner)?;
        let result = compiled.eval(minijinja::Value::from_serialize(ctx))?;
        Ok(serde_json::to_value(&result)?)
    }

    /// Jinja truthiness of an expression. Evaluation failures are logged
    /// and read as false so a bad `when` never wedges an execution.
    pub fn truthy(&self, expr: &str, ctx: &Value) -> bool {
        let inner = strip_braces(expr);
        match self.env.compile_expression(inner) {
            Ok(compiled) => match compiled.eval(minijinja::Value::from_serialize(ctx)) {
                Ok(v) => v.is_true(),
                Err(e) => {
                    tracing::warn!(expr = inner, error = %e, "condition evaluation failed");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(expr = inner, error = %e, "condition did not compile");
                false
            }
        }
    }

    /// Deep-render a JSON value: every string leaf is rendered; a string
    /// that is exactly one expression keeps the expression's native type.
    pub fn render_value(&self, value: &Value, ctx: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(s) => {
                if let Some(expr) = whole_expression(s) {
                    self.eval(expr, ctx)
                } else {
                    Ok(Value::String(self.render_str(s, ctx)?))
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, ctx)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for Templates {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip one level of `{{ }}` wrapping, if present.
fn strip_braces(expr: &str) -> &str {
    let trimmed = expr.trim();
    if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
        inner.trim()
    } else {
        trimmed
    }
}

/// Returns the inner expression when `s` is exactly one `{{ expr }}`.
fn whole_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;
