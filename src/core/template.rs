//! Template resolution for `{{ ... }}` expressions
//!
//! Supported references:
//! - `steps.<name>.result[.<path>]` (also `.success`, `.error`, `.duration_ms`, `.metadata`;
//!   `.output` is accepted as an alias of `.result`)
//! - `global_vars.<name>[.<path>]`
//! - `workflow.<path>`
//! - scope locals such as `task.<path>` inside batch steps
//! - a bare `<name>[.<path>]`, looked up in the global variables
//!
//! A template consisting of exactly one expression resolves to the referenced
//! value with its type intact. Expressions embedded in text are stringified.

use crate::core::context::ExecutionContext;
use crate::error::EngineError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

fn expression_regex() -> &'static Regex {
    static EXPR: OnceLock<Regex> = OnceLock::new();
    EXPR.get_or_init(|| {
        Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").unwrap_or_else(|e| panic!("invalid template regex: {e}"))
    })
}

/// What templates can see while resolving
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    pub context: &'a ExecutionContext,
    pub locals: Option<&'a Map<String, Value>>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a ExecutionContext) -> Self {
        Self {
            context,
            locals: None,
        }
    }

    pub fn with_locals(context: &'a ExecutionContext, locals: &'a Map<String, Value>) -> Self {
        Self {
            context,
            locals: Some(locals),
        }
    }
}

/// Outcome of resolving one template
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    /// Expressions that could not be resolved and were left as literal text
    pub unresolved: Vec<String>,
}

/// Resolves templates against an execution context
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResolver {
    strict: bool,
}

impl TemplateResolver {
    /// Permissive resolver: unresolved references stay as literal text
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Strict resolver: unresolved references are errors
    pub fn strict() -> Self {
        Self { strict: true }
    }

    pub fn with_strict(strict: bool) -> Self {
        Self { strict }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Resolve a template against a context
    pub fn resolve(&self, template: &str, context: &ExecutionContext) -> Result<Value, EngineError> {
        self.resolve_in(template, Scope::new(context))
    }

    /// Resolve a template within a scope
    pub fn resolve_in(&self, template: &str, scope: Scope<'_>) -> Result<Value, EngineError> {
        let resolution = Self::resolve_detailed(template, scope);
        match resolution.unresolved.first() {
            Some(expr) if self.strict => Err(EngineError::UnresolvedTemplate(expr.clone())),
            _ => Ok(resolution.value),
        }
    }

    /// Resolve and stringify, for prompts and names
    pub fn resolve_string(&self, template: &str, scope: Scope<'_>) -> Result<String, EngineError> {
        Ok(stringify(&self.resolve_in(template, scope)?))
    }

    /// Resolve every string inside a structured value
    pub fn resolve_value(&self, value: &Value, scope: Scope<'_>) -> Result<Value, EngineError> {
        match value {
            Value::String(template) => self.resolve_in(template, scope),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve_value(v, scope)?)))
                .collect::<Result<Map<_, _>, EngineError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolve without applying the strictness policy
    pub fn resolve_detailed(template: &str, scope: Scope<'_>) -> Resolution {
        let regex = expression_regex();
        let trimmed = template.trim();

        // Exactly one expression: keep the value's type
        if let Some(caps) = regex.captures(trimmed) {
            if caps.get(0).map(|m| m.as_str().len()) == Some(trimmed.len()) {
                let expr = caps[1].to_string();
                return match lookup(&expr, scope) {
                    Some(value) => Resolution {
                        value,
                        unresolved: Vec::new(),
                    },
                    None => Resolution {
                        value: Value::String(template.to_string()),
                        unresolved: vec![expr],
                    },
                };
            }
        }

        let mut unresolved = Vec::new();
        let rendered = regex.replace_all(template, |caps: &regex::Captures<'_>| {
            match lookup(&caps[1], scope) {
                Some(value) => stringify(&value),
                None => {
                    unresolved.push(caps[1].to_string());
                    caps[0].to_string()
                }
            }
        });

        Resolution {
            value: Value::String(rendered.into_owned()),
            unresolved,
        }
    }
}

/// True if the text contains at least one `{{ ... }}` expression
pub fn has_expressions(text: &str) -> bool {
    expression_regex().is_match(text)
}

/// Render a value as prompt text
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Look up one expression (without braces)
pub fn lookup(expr: &str, scope: Scope<'_>) -> Option<Value> {
    let segments: Vec<&str> = expr.split('.').map(str::trim).collect();
    let ctx = scope.context;

    match segments.as_slice() {
        ["steps", name, rest @ ..] => {
            let result = ctx.result(name)?;
            match rest {
                [] => Some(result.output.clone()),
                ["output", tail @ ..] => navigate(&result.output, tail).cloned(),
                _ => navigate(&result.to_template_value(), rest).cloned(),
            }
        }
        ["global_vars", name, rest @ ..] => navigate(ctx.global_var(name)?, rest).cloned(),
        ["workflow", rest @ ..] => {
            let (first, tail) = rest.split_first()?;
            navigate(ctx.workflow().get(*first)?, tail).cloned()
        }
        [first, rest @ ..] => {
            if let Some(local) = scope.locals.and_then(|locals| locals.get(*first)) {
                return navigate(local, rest).cloned();
            }
            navigate(ctx.global_var(first)?, rest).cloned()
        }
        [] => None,
    }
}

/// Dot-indexed lookup into a structured value; numeric segments index arrays
pub fn navigate<'v, S: AsRef<str>>(value: &'v Value, path: &[S]) -> Option<&'v Value> {
    path.iter().try_fold(value, |current, segment| {
        let segment = segment.as_ref();
        match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    })
}
