//! The expression layer (component A): a restricted sum type over
//! `{Text, Var, Link, Env, Lambda}` value specifications, plus dependency
//! extraction and async rendering against a [`RenderContext`].

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::OnceLock;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config;
use crate::error::{Error, Result};
use crate::lambda_eval;

/// A dependency on an upstream id, carrying whether the caller wants every
/// partial value that id streams (`true`) or only its final value (`false`).
pub type Dependency = (String, bool);

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Expression {
    Text { text: String, stream: bool },
    Var { path: String, stream: bool },
    Link { path: String, stream: bool },
    Env { name: String, stream: bool },
    Lambda { source: String, stream: bool },
    /// A plain literal scalar/container with no expression keys present.
    Literal(Value),
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Expression::from_value(raw).map_err(D::Error::custom)
    }
}

impl Expression {
    pub fn from_value(raw: Value) -> Result<Expression> {
        match raw {
            Value::String(s) => Ok(Expression::Text { text: s, stream: false }),
            Value::Object(ref map) => {
                let stream = map.get("stream").and_then(Value::as_bool).unwrap_or(false);
                if let Some(Value::String(text)) = map.get("text") {
                    return Ok(Expression::Text { text: text.clone(), stream });
                }
                if let Some(v) = map.get("var") {
                    return Ok(Expression::Var { path: expect_path(v)?, stream });
                }
                if let Some(v) = map.get("link") {
                    return Ok(Expression::Link { path: expect_path(v)?, stream });
                }
                if let Some(Value::String(name)) = map.get("env") {
                    return Ok(Expression::Env { name: name.clone(), stream });
                }
                if let Some(v) = map.get("lambda") {
                    let source = match v {
                        Value::String(s) => s.clone(),
                        other => {
                            return Err(Error::InvalidExpression(format!(
                                "lambda expression must be a string, got {other}"
                            )))
                        }
                    };
                    return Ok(Expression::Lambda { source, stream });
                }
                Ok(Expression::Literal(raw))
            }
            other => Ok(Expression::Literal(other)),
        }
    }

    pub fn stream(&self) -> bool {
        match self {
            Expression::Text { stream, .. }
            | Expression::Var { stream, .. }
            | Expression::Link { stream, .. }
            | Expression::Env { stream, .. }
            | Expression::Lambda { stream, .. } => *stream,
            Expression::Literal(_) => false,
        }
    }

    /// Root identifiers this expression depends on, paired with its stream flag.
    pub fn dependencies(&self) -> Result<HashSet<Dependency>> {
        let stream = self.stream();
        match self {
            Expression::Text { text, .. } => Ok(extract_template_roots(text)
                .into_iter()
                .map(|id| (id, stream))
                .collect()),
            Expression::Var { path, .. } | Expression::Link { path, .. } => {
                let root = root_segment(path);
                Ok(HashSet::from([(root, stream)]))
            }
            Expression::Env { .. } => Ok(HashSet::new()),
            Expression::Lambda { source, .. } => {
                let ast = lambda_eval::parse(source)?;
                Ok(lambda_eval::free_names(&ast)
                    .into_iter()
                    .map(|id| (id, stream))
                    .collect())
            }
            Expression::Literal(_) => Ok(HashSet::new()),
        }
    }

    pub async fn render(&self, ctx: &RenderContext) -> Result<Value> {
        match self {
            Expression::Text { text, .. } => render_text(text, ctx),
            Expression::Var { path, .. } | Expression::Link { path, .. } => {
                ctx.resolve_path(path)
            }
            Expression::Env { name, .. } => config::lookup(name).map(Value::String),
            Expression::Lambda { source, .. } => {
                let ast = lambda_eval::parse(source)?;
                lambda_eval::eval(&ast, &ctx.variables)
            }
            Expression::Literal(v) => Ok(v.clone()),
        }
    }
}

/// A snapshot of the merged `{id -> outputs}` and user-variable context a
/// render happens against, plus the registered default-output fields needed
/// to resolve a bare `{{ actionId }}` reference to `actionId.<default_output>`.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub variables: HashMap<String, Value>,
    pub default_outputs: HashMap<String, String>,
}

impl RenderContext {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self { variables, default_outputs: HashMap::new() }
    }

    pub fn merged(&self, extra: &HashMap<String, Value>) -> Self {
        let mut variables = self.variables.clone();
        variables.extend(extra.clone());
        Self { variables, default_outputs: self.default_outputs.clone() }
    }

    /// Resolves a dotted path, expanding a bare root into its registered
    /// default-output field when one exists and no further segment was given.
    pub fn resolve_path(&self, path: &str) -> Result<Value> {
        let mut segments = path.split('.');
        let root = segments
            .next()
            .ok_or_else(|| Error::UnknownVariable(path.to_string()))?;
        let mut value = self
            .variables
            .get(root)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(root.to_string()))?;
        let rest: Vec<&str> = segments.collect();
        if rest.is_empty() {
            if let Some(default_field) = self.default_outputs.get(root) {
                return self.resolve_path(&format!("{root}.{default_field}"));
            }
            return Ok(value);
        }
        for segment in rest {
            value = index_field(&value, segment)?;
        }
        Ok(value)
    }
}

fn index_field(value: &Value, segment: &str) -> Result<Value> {
    match value {
        Value::Object(map) => map
            .get(segment)
            .cloned()
            .ok_or_else(|| Error::UnknownVariable(segment.to_string())),
        Value::Array(items) => {
            let idx: usize = segment
                .parse()
                .map_err(|_| Error::UnknownVariable(segment.to_string()))?;
            items
                .get(idx)
                .cloned()
                .ok_or_else(|| Error::UnknownVariable(segment.to_string()))
        }
        _ => Err(Error::UnknownVariable(segment.to_string())),
    }
}

fn expect_path(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        other => Err(Error::InvalidExpression(format!(
            "expected a dotted path string, got {other}"
        ))),
    }
}

fn root_segment(path: &str) -> String {
    path.split('.').next().unwrap_or(path).to_string()
}

fn identifier_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)(?:[.\[][^}]*)?\s*\}\}|\{%-?\s*(?:for\s+\w+\s+in\s+|if\s+|elif\s+)?([A-Za-z_][A-Za-z0-9_]*)")
            .expect("static identifier regex is valid")
    })
}

fn bare_identifier_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}$")
            .expect("static bare-identifier regex is valid")
    })
}

/// Extracts the root identifiers referenced inside `{{ ... }}` / `{% ... %}`
/// blocks of a Jinja-style template, ignoring Tera/Jinja keywords.
fn extract_template_roots(template: &str) -> HashSet<String> {
    const KEYWORDS: &[&str] = &[
        "for", "in", "if", "elif", "else", "endif", "endfor", "not", "and", "or", "true", "false",
        "none", "loop",
    ];
    let mut roots = HashSet::new();
    for caps in identifier_regex().captures_iter(template) {
        for group in [caps.get(1), caps.get(2)] {
            if let Some(m) = group {
                let ident = m.as_str();
                if !KEYWORDS.contains(&ident) {
                    roots.insert(ident.to_string());
                }
            }
        }
    }
    roots
}

fn render_text(template: &str, ctx: &RenderContext) -> Result<Value> {
    // Fast path: a template that is exactly one `{{ dotted.path }}` reference
    // preserves the referenced value's native type instead of stringifying it.
    if let Some(caps) = bare_identifier_regex().captures(template.trim()) {
        let path = caps.get(1).expect("capture group 1 always matches").as_str();
        return ctx.resolve_path(path);
    }

    let mut tera_ctx = tera::Context::new();
    for (k, v) in &ctx.variables {
        tera_ctx.insert(k, v);
    }
    // Default-output expansion for any bare identifiers used as a whole value
    // inside a larger template: make `actionId` resolve through its default
    // output field too, by also inserting the resolved scalar under the id.
    for (id, field) in &ctx.default_outputs {
        if let Some(resolved) = ctx.resolve_path(&format!("{id}.{field}")).ok() {
            tera_ctx.insert(id, &resolved);
        }
    }

    let rendered = tera::Tera::one_off(template, &tera_ctx, false)?;
    if rendered.is_empty() {
        Ok(Value::String(String::new()))
    } else {
        Ok(Value::String(rendered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_string_deserializes_to_text() {
        let e: Expression = serde_json::from_value(json!("hello {{ name }}")).unwrap();
        assert!(matches!(e, Expression::Text { .. }));
    }

    #[test]
    fn discriminates_by_key_presence() {
        let e: Expression = serde_json::from_value(json!({"var": "first.result"})).unwrap();
        assert!(matches!(e, Expression::Var { .. }));
        let e: Expression = serde_json::from_value(json!({"link": "first.result", "stream": true})).unwrap();
        match e {
            Expression::Link { path, stream } => {
                assert_eq!(path, "first.result");
                assert!(stream);
            }
            _ => panic!("expected Link"),
        }
    }

    #[test]
    fn var_dependency_is_root_segment() {
        let e = Expression::Var { path: "first.result.nested".into(), stream: false };
        let deps = e.dependencies().unwrap();
        assert_eq!(deps, HashSet::from([("first".to_string(), false)]));
    }

    #[tokio::test]
    async fn bare_reference_preserves_native_type() {
        let mut vars = HashMap::new();
        vars.insert("first".to_string(), json!({"result": 7}));
        let ctx = RenderContext::new(vars);
        let e = Expression::Text { text: "{{ first.result }}".into(), stream: false };
        let rendered = e.render(&ctx).await.unwrap();
        assert_eq!(rendered, json!(7));
    }

    #[tokio::test]
    async fn concatenated_template_renders_as_string() {
        let mut vars = HashMap::new();
        vars.insert("first".to_string(), json!({"result": 7}));
        let ctx = RenderContext::new(vars);
        let e = Expression::Text { text: "value is {{ first.result }}".into(), stream: false };
        let rendered = e.render(&ctx).await.unwrap();
        assert_eq!(rendered, json!("value is 7"));
    }

    #[tokio::test]
    async fn default_output_expands_bare_root_reference() {
        let mut vars = HashMap::new();
        vars.insert("first".to_string(), json!({"result": 7, "other": 1}));
        let mut ctx = RenderContext::new(vars);
        ctx.default_outputs.insert("first".to_string(), "result".to_string());
        let e = Expression::Var { path: "first".into(), stream: false };
        let rendered = e.render(&ctx).await.unwrap();
        assert_eq!(rendered, json!(7));
    }

    #[tokio::test]
    async fn env_expression_fails_when_unset() {
        let ctx = RenderContext::default();
        let e = Expression::Env { name: "FLOWFORGE_TEST_DOES_NOT_EXIST".into(), stream: false };
        assert!(e.render(&ctx).await.is_err());
    }
}
