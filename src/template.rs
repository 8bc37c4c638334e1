//! Response synthesis.
//!
//! Static templates are expanded with Handlebars; function templates are
//! called with the request context.

use crate::context::RequestContext;
use crate::error::XhrError;
use crate::registry::{MockRule, ResponseTemplate};
use handlebars::{Context, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;

/// Expands a static template into a concrete value.
pub trait TemplateExpander: Send + Sync {
    fn expand(&self, template: &Value) -> Result<Value, XhrError>;
}

/// Template expander backed by Handlebars.
///
/// Every string containing `{{` is rendered. A string made of a single
/// expression whose output is a number or boolean becomes that JSON value.
pub struct HandlebarsExpander {
    handlebars: Handlebars<'static>,
}

impl HandlebarsExpander {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(CaseHelper(str::to_uppercase)));
        handlebars.register_helper("lower", Box::new(CaseHelper(str::to_lowercase)));

        // Output is JSON, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    fn expand_value(&self, value: &Value, scope: &Value) -> Result<Value, XhrError> {
        match value {
            Value::String(s) if s.contains("{{") => {
                let rendered = self.handlebars.render_template(s, scope)?;
                if is_single_expression(s) {
                    if let Ok(scalar @ (Value::Number(_) | Value::Bool(_))) =
                        serde_json::from_str::<Value>(rendered.trim())
                    {
                        return Ok(scalar);
                    }
                }
                Ok(Value::String(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.expand_value(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut expanded = serde_json::Map::new();
                for (k, v) in obj {
                    expanded.insert(k.clone(), self.expand_value(v, scope)?);
                }
                Ok(Value::Object(expanded))
            }
            _ => Ok(value.clone()),
        }
    }
}

impl Default for HandlebarsExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateExpander for HandlebarsExpander {
    fn expand(&self, template: &Value) -> Result<Value, XhrError> {
        // Static templates see no request data
        let scope = Value::Object(serde_json::Map::new());
        self.expand_value(template, &scope)
    }
}

fn is_single_expression(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.starts_with("{{") && trimmed.ends_with("}}") && trimmed.matches("{{").count() == 1
}

/// Produce the response body for a matched rule.
pub fn synthesize(
    rule: &MockRule,
    context: &RequestContext,
    expander: &dyn TemplateExpander,
) -> Result<Value, XhrError> {
    match rule.response_template() {
        ResponseTemplate::Function(f) => f(context).map_err(XhrError::Synthesis),
        ResponseTemplate::Static(template) => expander.expand(template),
    }
}

/// Serialize a body as multi-line JSON with four-space indentation.
pub fn format_body(value: &Value) -> Result<String, XhrError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    // serde_json only emits UTF-8
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

// Handlebars helpers

/// `{{uuid}}`: a random version 4 UUID.
fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let uuid = [&hex[0..8], &hex[8..12], &hex[12..16], &hex[16..20], &hex[20..32]].join("-");
    out.write(&uuid)?;
    Ok(())
}

/// `{{now}}`, `{{now "<strftime>"}}` or `{{now "millis"}}` for epoch milliseconds.
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let now = chrono::Utc::now();
    let rendered = match h.param(0).and_then(|v| v.value().as_str()) {
        Some("millis") => now.timestamp_millis().to_string(),
        Some(format) => now.format(format).to_string(),
        None => now.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    };
    out.write(&rendered)?;
    Ok(())
}

/// `{{random max}}` or `{{random min max}}`, both bounds inclusive.
fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let bound = |i: usize| h.param(i).and_then(|v| v.value().as_i64());
    let (min, max) = match (bound(0), bound(1)) {
        (Some(min), Some(max)) => (min, max),
        (Some(max), None) => (0, max),
        _ => (0, 100),
    };

    let value = rand::thread_rng().gen_range(min.min(max)..=min.max(max));
    out.write(&value.to_string())?;
    Ok(())
}

/// `{{default value "fallback"}}`: the fallback for a missing, null or empty value.
fn default_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let fallback = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");
    match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::String(_)) | Some(Value::Null) | None => out.write(fallback)?,
        Some(other) => out.write(&other.to_string())?,
    }
    Ok(())
}

/// `{{upper x}}` / `{{lower x}}`. Non-string values are converted via their JSON text.
struct CaseHelper(fn(&str) -> String);

impl HelperDef for CaseHelper {
    fn call<'reg: 'rc, 'rc>(
        &self,
        h: &Helper<'rc>,
        _: &'reg Handlebars<'reg>,
        _: &'rc Context,
        _: &mut RenderContext<'reg, 'rc>,
        out: &mut dyn Output,
    ) -> HelperResult {
        let text = match h.param(0).map(|v| v.value()) {
            Some(Value::String(s)) => (self.0)(s),
            Some(Value::Null) | None => String::new(),
            Some(other) => (self.0)(&other.to_string()),
        };
        out.write(&text)?;
        Ok(())
    }
}
