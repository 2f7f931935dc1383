//! Template rendering for step inputs, guards, compensation inputs and
//! workflow outputs.
//!
//! Templates render against one flat scope object: `input` (the caller's
//! JSON), `variables`, and every recorded step output under its output
//! name. Rendering is strict; an undefined variable is an error, never an
//! empty string.

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use tera::{Context as TeraContext, Tera};

use crate::error::EngineError;
use crate::workflow::is_template;

/// Render one template against the scope.
pub fn render(template: &str, scope: &JsonValue) -> Result<String, EngineError> {
    let context = TeraContext::from_serialize(scope)
        .map_err(|err| EngineError::Template(flatten(&err)))?;
    Tera::one_off(template, &context, false).map_err(|err| EngineError::Template(flatten(&err)))
}

/// Resolve a step (or compensation) input map. String values that look
/// like templates are rendered; every other value passes through verbatim.
pub fn resolve_map(
    input: &HashMap<String, JsonValue>,
    scope: &JsonValue,
) -> Result<HashMap<String, JsonValue>, EngineError> {
    let mut resolved = HashMap::with_capacity(input.len());
    for (key, value) in input {
        let value = match value {
            JsonValue::String(text) if is_template(text) => {
                let rendered = render(text, scope).map_err(|err| {
                    EngineError::Template(format!("key {key}: {err}"))
                })?;
                JsonValue::String(rendered)
            }
            other => other.clone(),
        };
        resolved.insert(key.clone(), value);
    }
    Ok(resolved)
}

/// Tera wraps the real cause under a generic "failed to render" error;
/// surface the whole chain.
fn flatten(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
