//! Request matching logic.
//!
//! Decides whether a request's method and URL satisfy a rule.

use crate::error::XhrError;
use crate::registry::MockRule;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;

/// URL pattern of a rule.
#[derive(Debug, Clone)]
pub enum UrlPattern {
    /// Exact URL, URL plus `?query`, or (with a leading `/`) a path template
    Text(String),
    /// Regular expression tested against the URL
    Regex(Regex),
}

impl UrlPattern {
    /// Compile a regex URL pattern.
    pub fn regex(pattern: &str) -> Result<Self, XhrError> {
        Regex::new(pattern)
            .map(UrlPattern::Regex)
            .map_err(|e| XhrError::invalid_pattern(pattern, e))
    }

    /// Whether this pattern is a path template handed to the path compiler.
    pub fn is_path_template(&self) -> bool {
        matches!(self, UrlPattern::Text(text) if text.starts_with('/'))
    }

    pub fn as_str(&self) -> &str {
        match self {
            UrlPattern::Text(text) => text,
            UrlPattern::Regex(regex) => regex.as_str(),
        }
    }
}

impl From<&str> for UrlPattern {
    fn from(text: &str) -> Self {
        UrlPattern::Text(text.to_string())
    }
}

impl From<String> for UrlPattern {
    fn from(text: String) -> Self {
        UrlPattern::Text(text)
    }
}

impl From<Regex> for UrlPattern {
    fn from(regex: Regex) -> Self {
        UrlPattern::Regex(regex)
    }
}

/// Method pattern: a case-insensitive, unanchored regex.
#[derive(Debug, Clone)]
pub struct MethodPattern(Regex);

impl MethodPattern {
    pub fn new(pattern: &str) -> Result<Self, XhrError> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map(MethodPattern)
            .map_err(|e| XhrError::invalid_pattern(pattern, e))
    }

    /// Rebuild an existing regex with case-insensitivity.
    pub fn from_regex(regex: &Regex) -> Result<Self, XhrError> {
        Self::new(regex.as_str())
    }

    pub fn is_match(&self, method: &str) -> bool {
        self.0.is_match(method)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Compiles path templates such as `/users/:id` into matchers.
pub trait PathCompiler: Send + Sync {
    fn compile(&self, pattern: &str) -> Result<Regex, XhrError>;
}

/// Default path template compiler.
///
/// `:name` matches one segment and `:name?` an optional one. A parameter may
/// carry a literal suffix (`:name.json`, `:name?.json`). `*` matches a slash
/// followed by the rest of the path. Matching ignores case, a trailing slash
/// is tolerated and the whole URL must match.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathTemplateCompiler;

impl PathCompiler for PathTemplateCompiler {
    fn compile(&self, pattern: &str) -> Result<Regex, XhrError> {
        let mut source = String::from("^");

        for segment in pattern.split('/').filter(|s| !s.is_empty()) {
            if segment == "*" {
                source.push_str("/(?P<wild>.*)");
                continue;
            }
            let Some(param) = segment.strip_prefix(':') else {
                source.push('/');
                source.push_str(&regex::escape(segment));
                continue;
            };

            let name_end = param.find(|c: char| c == '?' || c == '.').unwrap_or(param.len());
            let (name, rest) = param.split_at(name_end);
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(XhrError::invalid_pattern(
                    pattern,
                    format!("invalid parameter name {:?}", name),
                ));
            }
            let (optional, suffix) = match rest.strip_prefix('?') {
                Some(suffix) => (true, suffix),
                None => (false, rest),
            };

            if suffix.is_empty() {
                if optional {
                    source.push_str(&format!("(?:/(?P<{}>[^/]+?))?", name));
                } else {
                    source.push_str(&format!("/(?P<{}>[^/]+?)", name));
                }
            } else {
                // /files/:name?.json also matches /files/.json
                source.push_str(&format!("/(?P<{}>[^/]+?)", name));
                if optional {
                    source.push('?');
                }
                source.push_str(&regex::escape(suffix));
            }
        }

        source.push_str("/?$");
        RegexBuilder::new(&source)
            .case_insensitive(true)
            .build()
            .map_err(|e| XhrError::invalid_pattern(pattern, e))
    }
}

/// Check whether a URL satisfies a URL pattern.
///
/// `compiled` is the compiled path template for `/`-prefixed text patterns.
pub fn matches_url(pattern: &UrlPattern, compiled: Option<&Regex>, url: &str) -> bool {
    match pattern {
        UrlPattern::Text(expected) => {
            if url == expected {
                return true;
            }
            // /hello/world matches /hello/world?type=1
            if url
                .strip_prefix(expected.as_str())
                .is_some_and(|rest| rest.starts_with('?'))
            {
                return true;
            }
            if expected.starts_with('/') {
                return compiled.is_some_and(|regex| regex.is_match(url));
            }
            false
        }
        UrlPattern::Regex(regex) => regex.is_match(url),
    }
}

/// Check a method against an optional pattern (absent = any method).
pub fn matches_method(pattern: Option<&MethodPattern>, method: &str) -> bool {
    pattern.map_or(true, |p| p.is_match(method))
}

/// Check whether a request matches a rule.
pub fn matches(rule: &MockRule, method: &str, url: &str) -> bool {
    matches_url(rule.url(), rule.compiled_path(), url) && matches_method(rule.method_pattern(), method)
}

/// Extract named path parameters captured by a compiled path template.
pub fn path_params(compiled: &Regex, url: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(captures) = compiled.captures(url) {
        for name in compiled.capture_names().flatten() {
            if let Some(m) = captures.name(name) {
                params.insert(name.to_string(), m.as_str().to_string());
            }
        }
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiled_rule(url: impl Into<UrlPattern>) -> MockRule {
        let mut rule = MockRule::new(url);
        rule.compile_path(&PathTemplateCompiler).unwrap();
        rule
    }

    #[test]
    fn test_exact_url_matching() {
        let rule = compiled_rule("http://example.com/api");
        assert!(matches(&rule, "GET", "http://example.com/api"));
        assert!(!matches(&rule, "GET", "http://example.com/apis"));
    }

    #[test]
    fn test_query_suffix_matching() {
        let rule = compiled_rule("http://example.com/api");
        assert!(matches(&rule, "GET", "http://example.com/api?page=1"));
        assert!(!matches(&rule, "GET", "http://example.com/api/extra"));
        assert!(!matches(&rule, "GET", "http://example.com/api#frag"));
    }

    #[test]
    fn test_path_template_matching() {
        let rule = compiled_rule("/api/user/:id");
        assert!(matches(&rule, "GET", "/api/user/42"));
        assert!(matches(&rule, "GET", "/api/user/42/"));
        assert!(!matches(&rule, "GET", "/api/order/42"));
        assert!(!matches(&rule, "GET", "/api/user/"));
        assert!(!matches(&rule, "GET", "/api/user/42/orders"));
    }

    #[test]
    fn test_path_template_needs_compilation() {
        let rule = MockRule::new("/api/user/:id");
        assert!(!matches(&rule, "GET", "/api/user/42"));
        assert!(matches(&rule, "GET", "/api/user/:id"));
    }

    #[test]
    fn test_optional_and_wildcard_segments() {
        let compiler = PathTemplateCompiler;
        let optional = compiler.compile("/books/:genre?").unwrap();
        assert!(optional.is_match("/books"));
        assert!(optional.is_match("/books/horror"));
        assert!(!optional.is_match("/books/horror/1"));

        let wild = compiler.compile("/static/*").unwrap();
        assert!(!wild.is_match("/static"));
        assert!(wild.is_match("/static/"));
        assert!(wild.is_match("/static/css/site.css"));
        assert_eq!(path_params(&wild, "/static/css/site.css")["wild"], "css/site.css");
        assert!(!wild.is_match("/assets/site.css"));
    }

    #[test]
    fn test_literal_segments_are_escaped() {
        let compiler = PathTemplateCompiler;
        let regex = compiler.compile("/files/data.json").unwrap();
        assert!(regex.is_match("/files/data.json"));
        assert!(!regex.is_match("/files/dataxjson"));
    }

    #[test]
    fn test_path_template_ignores_case() {
        let rule = compiled_rule("/api/user/:id");
        assert!(matches(&rule, "GET", "/API/User/42"));
        let params = path_params(rule.compiled_path().unwrap(), "/API/User/Ab");
        assert_eq!(params["id"], "Ab");
    }

    #[test]
    fn test_parameter_with_suffix() {
        let compiler = PathTemplateCompiler;
        let regex = compiler.compile("/files/:name.json").unwrap();
        assert_eq!(path_params(&regex, "/files/report.json")["name"], "report");
        assert!(!regex.is_match("/files/report"));
        assert!(!regex.is_match("/files/reportxjson"));

        let optional = compiler.compile("/files/:name?.json").unwrap();
        assert!(optional.is_match("/files/report.json"));
        assert!(optional.is_match("/files/.json"));
    }

    #[test]
    fn test_invalid_parameter_name() {
        let compiler = PathTemplateCompiler;
        assert!(compiler.compile("/users/:").is_err());
        assert!(compiler.compile("/users/:user-id").is_err());
    }

    #[test]
    fn test_path_params() {
        let regex = PathTemplateCompiler.compile("/users/:user/posts/:post").unwrap();
        let params = path_params(&regex, "/users/ada/posts/7");
        assert_eq!(params.get("user"), Some(&"ada".to_string()));
        assert_eq!(params.get("post"), Some(&"7".to_string()));
        assert!(path_params(&regex, "/nope").is_empty());
    }

    #[test]
    fn test_regex_url_matching() {
        let rule = compiled_rule(UrlPattern::regex(r"/api/items/\d+").unwrap());
        assert!(matches(&rule, "GET", "http://example.com/api/items/12?full=1"));
        assert!(!matches(&rule, "GET", "/api/items/abc"));
    }

    #[test]
    fn test_method_matching_case_insensitive() {
        let rule = compiled_rule("/api").method(MethodPattern::new("post").unwrap());
        assert!(matches(&rule, "POST", "/api"));
        assert!(matches(&rule, "post", "/api"));
        assert!(!matches(&rule, "GET", "/api"));
    }

    #[test]
    fn test_method_pattern_from_regex() {
        let pattern = MethodPattern::from_regex(&Regex::new("^(get|head)$").unwrap()).unwrap();
        assert!(matches_method(Some(&pattern), "HEAD"));
        assert!(!matches_method(Some(&pattern), "PUT"));
        assert!(matches_method(None, "ANYTHING"));
    }

    #[test]
    fn test_method_pattern_is_unanchored() {
        let pattern = MethodPattern::new("t").unwrap();
        assert!(pattern.is_match("GET"));
        assert!(pattern.is_match("POST"));
        assert!(!pattern.is_match("HEAD"));
    }

    #[test]
    fn test_relative_text_pattern_is_not_compiled() {
        let rule = compiled_rule("api/user");
        assert!(rule.compiled_path().is_none());
        assert!(matches(&rule, "GET", "api/user"));
        assert!(!matches(&rule, "GET", "api/user/1"));
    }
}
