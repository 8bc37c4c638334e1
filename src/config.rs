//! Configuration for the request shim.
//!
//! Defines global settings (including the simulated response delay) and
//! rule definitions that can be loaded from YAML.

use crate::error::XhrError;
use crate::matcher::{MethodPattern, PathCompiler, PathTemplateCompiler, UrlPattern};
use crate::registry::{MockRule, ResponseTemplate};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level configuration: rules plus global settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockXhrConfig {
    /// Rule definitions, matched in the order listed
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

impl MockXhrConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let compiler = PathTemplateCompiler;
        for (i, rule) in self.rules.iter().enumerate() {
            rule.validate(&compiler)
                .map_err(|e| anyhow::anyhow!("Rule {}: {}", i, e))?;
        }
        Ok(())
    }
}

/// A rule as written in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Optional label used in logs
    #[serde(default)]
    pub name: Option<String>,

    /// URL pattern
    pub url: UrlPatternDefinition,

    /// Method pattern, a case-insensitive regex (absent = any method)
    #[serde(default)]
    pub method: Option<String>,

    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Static response template
    #[serde(default)]
    pub response: serde_json::Value,
}

/// URL pattern as written in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UrlPatternDefinition {
    /// Plain string: exact, `?query` prefix, or `/path/:param` template
    Text(String),
    /// Regular expression tested against the whole URL
    Regex { regex: String },
}

impl RuleDefinition {
    /// Build the runtime rule described by this definition.
    pub fn to_rule(&self) -> Result<MockRule, XhrError> {
        let url = match &self.url {
            UrlPatternDefinition::Text(text) => UrlPattern::Text(text.clone()),
            UrlPatternDefinition::Regex { regex } => UrlPattern::regex(regex)?,
        };

        let mut rule = MockRule::new(url)
            .template(ResponseTemplate::Static(self.response.clone()));
        if let Some(name) = &self.name {
            rule = rule.name(name.clone());
        }
        if let Some(method) = &self.method {
            rule = rule.method(MethodPattern::new(method)?);
        }
        for (name, value) in &self.headers {
            rule = rule.header(name.clone(), value.clone());
        }
        Ok(rule)
    }

    /// Validate the definition, including path template compilation.
    pub fn validate(&self, compiler: &dyn PathCompiler) -> Result<(), XhrError> {
        if self.headers.keys().any(|name| name.trim().is_empty()) {
            return Err(XhrError::invalid_pattern("", "header name cannot be empty"));
        }
        let mut rule = self.to_rule()?;
        rule.compile_path(compiler)?;
        Ok(())
    }
}

/// Global settings shared by every request created from one environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Simulated delay before a mocked asynchronous request completes
    #[serde(default)]
    pub timeout: TimeoutSetting,

    /// Log every request that matched a rule
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log every request that fell through to the native transport
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            log_matches: true,
            log_unmatched: true,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Merge an update over these settings. Only keys present in the update change.
    pub fn merge(&mut self, update: SettingsUpdate) {
        if let Some(timeout) = update.timeout {
            self.timeout = timeout;
        }
        if let Some(log_matches) = update.log_matches {
            self.log_matches = log_matches;
        }
        if let Some(log_unmatched) = update.log_unmatched {
            self.log_unmatched = log_unmatched;
        }
    }
}

/// Partial settings for `MockXhr::setup`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub timeout: Option<TimeoutSetting>,
    #[serde(default)]
    pub log_matches: Option<bool>,
    #[serde(default)]
    pub log_unmatched: Option<bool>,
}

impl SettingsUpdate {
    pub fn timeout(mut self, timeout: impl Into<TimeoutSetting>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn log_matches(mut self, enabled: bool) -> Self {
        self.log_matches = Some(enabled);
        self
    }

    pub fn log_unmatched(mut self, enabled: bool) -> Self {
        self.log_unmatched = Some(enabled);
        self
    }
}

/// Delay setting: a number of milliseconds, a numeric string, or a
/// `"min-max"` range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TimeoutSetting {
    Millis(u64),
    /// Fractional or negative literal; truncated toward zero, negatives clamp to 0
    Number(f64),
    Text(String),
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        TimeoutSetting::Text("10-100".to_string())
    }
}

impl From<u64> for TimeoutSetting {
    fn from(ms: u64) -> Self {
        TimeoutSetting::Millis(ms)
    }
}

impl From<&str> for TimeoutSetting {
    fn from(text: &str) -> Self {
        TimeoutSetting::Text(text.to_string())
    }
}

impl From<String> for TimeoutSetting {
    fn from(text: String) -> Self {
        TimeoutSetting::Text(text)
    }
}

impl TimeoutSetting {
    /// Calculate the delay to apply, in milliseconds.
    ///
    /// A range yields a uniformly distributed value in `[min, max]`.
    /// Anything unparseable yields 0.
    pub fn resolve(&self) -> u64 {
        match self {
            TimeoutSetting::Millis(ms) => *ms,
            // Saturating cast: NaN and negatives become 0
            TimeoutSetting::Number(ms) => *ms as u64,
            TimeoutSetting::Text(text) => match text.split_once('-') {
                None => leading_integer(text).unwrap_or(0),
                Some((min, max)) => match (leading_integer(min), leading_integer(max)) {
                    (Some(min), Some(max)) => {
                        let (low, high) = if min <= max { (min, max) } else { (max, min) };
                        rand::thread_rng().gen_range(low..=high)
                    }
                    _ => 0,
                },
            },
        }
    }
}

/// Parse the leading decimal digits of a string, ignoring leading whitespace.
fn leading_integer(text: &str) -> Option<u64> {
    let text = text.trim_start();
    let end = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_rule() {
        let yaml = r#"
rules:
  - name: hello
    url: /hello
    method: get
    response:
      message: "Hello, World!"
"#;
        let config = MockXhrConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name.as_deref(), Some("hello"));
        assert_eq!(config.rules[0].response["message"], "Hello, World!");
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn test_parse_regex_url() {
        let yaml = r#"
rules:
  - url:
      regex: "^/api/.*"
    response: [1, 2, 3]
"#;
        let config = MockXhrConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.rules[0].url,
            UrlPatternDefinition::Regex {
                regex: "^/api/.*".to_string()
            }
        );
    }

    #[test]
    fn test_parse_settings() {
        let yaml = r#"
settings:
  timeout: 250
  log_unmatched: false
"#;
        let config = MockXhrConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.settings.timeout, TimeoutSetting::Millis(250));
        assert!(config.settings.log_matches);
        assert!(!config.settings.log_unmatched);

        let config = MockXhrConfig::from_yaml("settings:\n  timeout: \"5-15\"\n").unwrap();
        assert_eq!(config.settings.timeout, TimeoutSetting::Text("5-15".to_string()));
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let yaml = r#"
rules:
  - url:
      regex: "(unclosed"
"#;
        let err = MockXhrConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Rule 0"));
    }

    #[test]
    fn test_invalid_method_rejected() {
        let yaml = r#"
rules:
  - url: /ok
  - url: /bad
    method: "[get"
"#;
        let err = MockXhrConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("Rule 1"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
rules:
  - url: /hello
    priority: 10
"#;
        assert!(MockXhrConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "rules:\n  - url: /from-file\n    response: ok").unwrap();

        let config = MockXhrConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].response, serde_json::json!("ok"));
    }

    #[test]
    fn test_rule_headers_in_name_order() {
        let yaml = r#"
rules:
  - url: /headers
    headers:
      X-Trace: abc
      Content-Type: application/json
"#;
        let config = MockXhrConfig::from_yaml(yaml).unwrap();
        let rule = config.rules[0].to_rule().unwrap();
        let names: Vec<_> = rule.headers().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Content-Type", "X-Trace"]);
    }

    #[test]
    fn test_settings_merge_only_present_keys() {
        let mut settings = Settings::default();
        settings.merge(SettingsUpdate::default().timeout(400));
        assert_eq!(settings.timeout, TimeoutSetting::Millis(400));
        assert!(settings.log_matches);

        settings.merge(SettingsUpdate::default().log_matches(false));
        assert_eq!(settings.timeout, TimeoutSetting::Millis(400));
        assert!(!settings.log_matches);
    }

    #[test]
    fn test_timeout_literal_and_numeric_string() {
        assert_eq!(TimeoutSetting::Millis(42).resolve(), 42);
        assert_eq!(TimeoutSetting::from("250").resolve(), 250);
        assert_eq!(TimeoutSetting::from(" 30ms").resolve(), 30);
    }

    #[test]
    fn test_timeout_non_integer_literals() {
        let settings: Settings = serde_yaml::from_str("timeout: 1.5").unwrap();
        assert_eq!(settings.timeout, TimeoutSetting::Number(1.5));
        assert_eq!(settings.timeout.resolve(), 1);

        let settings: Settings = serde_yaml::from_str("timeout: -5").unwrap();
        assert_eq!(settings.timeout, TimeoutSetting::Number(-5.0));
        assert_eq!(settings.timeout.resolve(), 0);

        let settings: Settings = serde_yaml::from_str("timeout: 80").unwrap();
        assert_eq!(settings.timeout, TimeoutSetting::Millis(80));
    }

    #[test]
    fn test_timeout_garbage_is_zero() {
        assert_eq!(TimeoutSetting::from("soon").resolve(), 0);
        assert_eq!(TimeoutSetting::from("").resolve(), 0);
        assert_eq!(TimeoutSetting::from("a-b").resolve(), 0);
        assert_eq!(TimeoutSetting::from("-5").resolve(), 0);
    }

    #[test]
    fn test_timeout_range_inclusive() {
        let setting = TimeoutSetting::from("10-100");
        let samples: Vec<u64> = (0..1000).map(|_| setting.resolve()).collect();
        assert!(samples.iter().all(|ms| (10..=100).contains(ms)));
        assert!(*samples.iter().min().unwrap() < 20);
        assert!(*samples.iter().max().unwrap() > 90);

        assert_eq!(TimeoutSetting::from("7-7").resolve(), 7);
        assert!((5..=9).contains(&TimeoutSetting::from("9-5").resolve()));
    }
}
