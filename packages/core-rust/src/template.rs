//! `[placeholder]` templating for configured strings.
//!
//! A placeholder is `[name]` where `name` matches `[A-Za-z0-9_.-]+`. Names are
//! looked up first among the reserved values bound from the active provider
//! and invocation, then in the query context. One unresolved placeholder
//! makes the whole value unresolved.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::context::QueryContext;
use crate::model::Provider;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([A-Za-z0-9_.\-]+)\]").expect("placeholder pattern is valid")
});

/// Canonical integers only: `007` stays text.
static INTEGER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?(0|[1-9][0-9]*)$").expect("integer pattern is valid"));

/// Reserved placeholder names.
pub mod reserved {
    pub const USER_ID: &str = "user_id";
    pub const SECRET_KEY: &str = "secret_key";
    pub const ACCESS_KEY: &str = "access_key";
    pub const QUERY: &str = "query";
    pub const TIMESTAMP: &str = "timestamp";
}

/// Outcome of resolving one configured string.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved(Value),
    /// The first placeholder that could not be bound.
    Unresolved { placeholder: String },
}

impl Resolution {
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// The resolved value, `None` when unresolved.
    #[must_use]
    pub fn value(self) -> Option<Value> {
        match self {
            Self::Resolved(v) => Some(v),
            Self::Unresolved { .. } => None,
        }
    }

    /// The resolved value rendered as text, `None` when unresolved.
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        self.value().map(|v| value_to_text(&v))
    }
}

/// Values bound to the reserved placeholder names for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservedValues {
    pub user_id: Option<String>,
    pub secret_key: Option<String>,
    pub access_key: Option<String>,
    pub query: Option<String>,
    /// Unix seconds at the start of the call.
    pub timestamp: u64,
}

impl ReservedValues {
    #[must_use]
    pub fn new(provider: &Provider, ctx: &QueryContext, timestamp: u64) -> Self {
        Self {
            user_id: provider.user_id.clone(),
            secret_key: provider.secret_key.clone(),
            access_key: provider.access_key.clone(),
            query: ctx.query.clone(),
            timestamp,
        }
    }

    /// `true` when `name` is one of the reserved placeholder names.
    #[must_use]
    pub fn is_reserved(name: &str) -> bool {
        matches!(
            name,
            reserved::USER_ID
                | reserved::SECRET_KEY
                | reserved::ACCESS_KEY
                | reserved::QUERY
                | reserved::TIMESTAMP
        )
    }

    fn get(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.as_ref().map(|s| Value::String(s.clone()));
        match name {
            reserved::USER_ID => text(&self.user_id),
            reserved::SECRET_KEY => text(&self.secret_key),
            reserved::ACCESS_KEY => text(&self.access_key),
            reserved::QUERY => text(&self.query),
            reserved::TIMESTAMP => Some(Value::from(self.timestamp)),
            _ => None,
        }
    }
}

/// Binds placeholders against reserved values and a query context.
#[derive(Debug, Clone, Copy)]
pub struct TemplateResolver<'a> {
    reserved: &'a ReservedValues,
    ctx: &'a QueryContext,
}

impl<'a> TemplateResolver<'a> {
    #[must_use]
    pub fn new(reserved: &'a ReservedValues, ctx: &'a QueryContext) -> Self {
        Self { reserved, ctx }
    }

    /// Looks up one placeholder name. A reserved name with no bound value is
    /// unresolved and does not fall through to the context.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Value> {
        let found = if ReservedValues::is_reserved(name) {
            self.reserved.get(name)
        } else {
            self.ctx.get(name).cloned()
        };
        found.filter(|v| !v.is_null())
    }

    /// Resolves `raw`.
    ///
    /// A string that is exactly one placeholder yields the bound value as is
    /// (arrays stay arrays). Otherwise every placeholder is substituted as
    /// text. Integer-looking results become numbers.
    #[must_use]
    pub fn resolve(&self, raw: &str) -> Resolution {
        let trimmed = raw.trim();
        if let Some(caps) = PLACEHOLDER_RE.captures(trimmed) {
            if caps.get(0).is_some_and(|m| m.as_str().len() == trimmed.len()) {
                let name = &caps[1];
                return match self.lookup(name) {
                    Some(Value::String(s)) => Resolution::Resolved(cast_numeric(s)),
                    Some(v) => Resolution::Resolved(v),
                    None => Resolution::Unresolved {
                        placeholder: name.to_string(),
                    },
                };
            }
        }

        let mut out = String::with_capacity(raw.len());
        let mut last = 0;
        for caps in PLACEHOLDER_RE.captures_iter(raw) {
            let Some(whole) = caps.get(0) else { continue };
            let name = &caps[1];
            let Some(value) = self.lookup(name) else {
                return Resolution::Unresolved {
                    placeholder: name.to_string(),
                };
            };
            out.push_str(&raw[last..whole.start()]);
            out.push_str(&value_to_text(&value));
            last = whole.end();
        }
        out.push_str(&raw[last..]);
        Resolution::Resolved(cast_numeric(out))
    }
}

/// Placeholder names referenced by `raw`, in order of appearance.
#[must_use]
pub fn placeholders(raw: &str) -> Vec<&str> {
    PLACEHOLDER_RE
        .captures_iter(raw)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Renders a JSON value as template text. Arrays are comma-joined.
#[must_use]
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => value.to_string(),
    }
}

fn cast_numeric(text: String) -> Value {
    if INTEGER_RE.is_match(&text) {
        if let Ok(n) = text.parse::<i64>() {
            return Value::from(n);
        }
    }
    Value::String(text)
}
