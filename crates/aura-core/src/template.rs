//! Template rendering for task parameters
//!
//! Strings containing `{{` or `{%` are evaluated as minijinja templates over
//! a context snapshot. Rendering never fails the caller: undefined
//! references and template errors log and yield `null`. Rendered strings
//! that parse as JSON are revived into typed values so expressions like
//! `{{ items | length }}` come back as numbers, not strings.
//!
//! The environment is sandboxed by construction: templates see only the
//! snapshot object plus a `config()` accessor, never host objects.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;

const MARKER_EXPR: &str = "{{";
const MARKER_STMT: &str = "{%";

/// Renders task parameters and conditions against a context snapshot
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl TemplateRenderer {
    /// Build a renderer with the `config()` global wired to the layered
    /// configuration.
    pub fn new(config: Config) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_function(
            "config",
            move |key: String, default: Option<minijinja::Value>| -> minijinja::Value {
                match config.get(&key) {
                    Some(value) => minijinja::Value::from_serialize(&value),
                    None => default.unwrap_or(minijinja::Value::from(())),
                }
            },
        );
        Self { env }
    }

    /// Whether a string needs template evaluation at all.
    pub fn is_template(text: &str) -> bool {
        text.contains(MARKER_EXPR) || text.contains(MARKER_STMT)
    }

    /// Render one string template. Errors downgrade to `null`.
    pub fn render_str(&self, template: &str, snapshot: &Value) -> Value {
        match self.env.render_str(template, snapshot) {
            Ok(rendered) => revive(rendered),
            Err(err) => {
                warn!(template, %err, "template rendering failed, yielding null");
                Value::Null
            }
        }
    }

    /// Recursively render a value: strings with markers are evaluated,
    /// maps and lists recurse, everything else passes through.
    pub fn render_value(&self, value: &Value, snapshot: &Value) -> Value {
        match value {
            Value::String(text) if Self::is_template(text) => self.render_str(text, snapshot),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v, snapshot)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.render_value(item, snapshot))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Render a value and report whether the result is truthy, for `when`
    /// and `if`/`while` conditions.
    pub fn render_truthy(&self, value: &Value, snapshot: &Value) -> bool {
        truthy(&self.render_value(value, snapshot))
    }
}

/// Revive a rendered string into a typed value when it parses as JSON.
fn revive(rendered: String) -> Value {
    let trimmed = rendered.trim();
    match trimmed {
        "" => Value::String(rendered),
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        "None" | "none" => Value::Null,
        _ => serde_json::from_str(trimmed).unwrap_or(Value::String(rendered)),
    }
}

/// Truthiness matching template semantics: null, false, 0, "", empty
/// collections are falsy, everything else truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false" && s != "False",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(Config::new())
    }

    #[test]
    fn test_plain_strings_pass_through() {
        let r = renderer();
        let out = r.render_value(&json!("no markers here"), &json!({}));
        assert_eq!(out, json!("no markers here"));
    }

    #[test]
    fn test_expression_revives_types() {
        let r = renderer();
        let snapshot = json!({"count": 3, "flag": true, "name": "aura"});

        assert_eq!(r.render_value(&json!("{{ count }}"), &snapshot), json!(3));
        assert_eq!(r.render_value(&json!("{{ flag }}"), &snapshot), json!(true));
        assert_eq!(
            r.render_value(&json!("{{ name }}"), &snapshot),
            json!("aura")
        );
    }

    #[test]
    fn test_undefined_yields_null() {
        let r = renderer();
        assert_eq!(
            r.render_value(&json!("{{ missing.thing }}"), &json!({})),
            Value::Null
        );
    }

    #[test]
    fn test_template_error_yields_null() {
        let r = renderer();
        assert_eq!(
            r.render_value(&json!("{% bogus %}"), &json!({})),
            Value::Null
        );
    }

    #[test]
    fn test_recursive_rendering() {
        let r = renderer();
        let snapshot = json!({"x": 7});
        let params = json!({
            "a": "{{ x }}",
            "b": ["{{ x }}", "plain"],
            "c": {"d": "{{ x }}"}
        });
        let out = r.render_value(&params, &snapshot);
        assert_eq!(out, json!({"a": 7, "b": [7, "plain"], "c": {"d": 7}}));
    }

    #[test]
    fn test_config_global() {
        let config = Config::new();
        config.register_plan_config(
            "p",
            json!({"greeting": "hello"}).as_object().unwrap().clone(),
        );
        let r = TemplateRenderer::new(config);

        assert_eq!(
            r.render_value(&json!("{{ config('greeting') }}"), &json!({})),
            json!("hello")
        );
        assert_eq!(
            r.render_value(&json!("{{ config('absent', 5) }}"), &json!({})),
            json!(5)
        );
    }

    #[test]
    fn test_truthiness() {
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(truthy(&json!("yes")));
        assert!(!truthy(&json!(false)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(!truthy(&Value::Null));
        assert!(!truthy(&json!([])));
    }

    #[test]
    fn test_condition_rendering() {
        let r = renderer();
        let snapshot = json!({"steps": {"x": true}});
        assert!(r.render_truthy(&json!("{{ steps.x }}"), &snapshot));
        assert!(!r.render_truthy(&json!("{{ steps.missing }}"), &snapshot));
    }
}
