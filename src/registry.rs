//! Rule registry.
//!
//! Rules are kept in registration order and the first full match wins.

use crate::context::RequestContext;
use crate::error::XhrError;
use crate::matcher::{self, MethodPattern, PathCompiler, UrlPattern};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Signature of a function response template.
pub type TemplateFn = dyn Fn(&RequestContext) -> anyhow::Result<Value> + Send + Sync;

/// How a matched rule produces its response body.
#[derive(Clone)]
pub enum ResponseTemplate {
    /// Static value, passed through the template expander
    Static(Value),
    /// Function of the request context; its return value is the body
    Function(Arc<TemplateFn>),
}

impl ResponseTemplate {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        ResponseTemplate::Function(Arc::new(f))
    }
}

impl Default for ResponseTemplate {
    fn default() -> Self {
        ResponseTemplate::Static(Value::Null)
    }
}

impl From<Value> for ResponseTemplate {
    fn from(value: Value) -> Self {
        ResponseTemplate::Static(value)
    }
}

impl fmt::Debug for ResponseTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseTemplate::Static(value) => f.debug_tuple("Static").field(value).finish(),
            ResponseTemplate::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// A mock rule: URL pattern, optional method pattern, response template.
#[derive(Debug, Clone)]
pub struct MockRule {
    name: Option<String>,
    url: UrlPattern,
    method: Option<MethodPattern>,
    template: ResponseTemplate,
    headers: Vec<(String, String)>,
    compiled_path: Option<Regex>,
}

impl MockRule {
    pub fn new(url: impl Into<UrlPattern>) -> Self {
        Self {
            name: None,
            url: url.into(),
            method: None,
            template: ResponseTemplate::default(),
            headers: Vec::new(),
            compiled_path: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn method(mut self, pattern: MethodPattern) -> Self {
        self.method = Some(pattern);
        self
    }

    pub fn template(mut self, template: impl Into<ResponseTemplate>) -> Self {
        self.template = template.into();
        self
    }

    /// Add a response header. Headers are exposed in the order added.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn url(&self) -> &UrlPattern {
        &self.url
    }

    pub fn method_pattern(&self) -> Option<&MethodPattern> {
        self.method.as_ref()
    }

    pub fn response_template(&self) -> &ResponseTemplate {
        &self.template
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn compiled_path(&self) -> Option<&Regex> {
        self.compiled_path.as_ref()
    }

    /// Label for logs: the rule name, or its URL pattern.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.url.as_str())
    }

    /// Compile a `/`-prefixed text URL pattern with the given compiler.
    pub(crate) fn compile_path(&mut self, compiler: &dyn PathCompiler) -> Result<(), XhrError> {
        if self.url.is_path_template() {
            self.compiled_path = Some(compiler.compile(self.url.as_str())?);
        }
        Ok(())
    }
}

/// Result of matching a request against the registry.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// The matched rule
    pub rule: Arc<MockRule>,
    /// Parameters captured by a path template
    pub params: HashMap<String, String>,
}

/// Insertion-ordered rule storage.
#[derive(Debug, Default)]
pub struct Registry {
    rules: RwLock<Vec<Arc<MockRule>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, compiling its path template first.
    pub fn register(
        &self,
        mut rule: MockRule,
        compiler: &dyn PathCompiler,
    ) -> Result<Arc<MockRule>, XhrError> {
        rule.compile_path(compiler)?;
        let rule = Arc::new(rule);
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&rule));
        Ok(rule)
    }

    /// Find the first rule, in registration order, matching the request.
    ///
    /// A rule without a method pattern matches on URL alone, so an earlier
    /// URL-only rule masks later rules for the same URL.
    pub fn find(&self, method: &str, url: &str) -> Option<RuleMatch> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules
            .iter()
            .find(|rule| matcher::matches(rule, method, url))
            .map(|rule| RuleMatch {
                rule: Arc::clone(rule),
                params: rule
                    .compiled_path()
                    .map(|compiled| matcher::path_params(compiled, url))
                    .unwrap_or_default(),
            })
    }

    /// Snapshot of the registered rules, in order.
    pub fn rules(&self) -> Vec<Arc<MockRule>> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
