//! The mock environment: settings, rules and collaborators shared by every
//! request created from it.

use crate::config::{MockXhrConfig, RuleDefinition, Settings, SettingsUpdate};
use crate::error::XhrError;
use crate::matcher::{PathCompiler, PathTemplateCompiler};
use crate::registry::{MockRule, Registry, RuleMatch};
use crate::template::{HandlebarsExpander, TemplateExpander};
use crate::transport::{NativeTransport, UnavailableTransport};
use crate::xhr::XmlHttpRequest;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Process-wide mock state.
///
/// Build one, register rules, wrap it in an `Arc` and create requests with
/// [`MockXhr::request`]. Rules are matched in registration order.
pub struct MockXhr {
    settings: RwLock<Settings>,
    registry: Registry,
    transport: Box<dyn NativeTransport>,
    expander: Box<dyn TemplateExpander>,
    compiler: Box<dyn PathCompiler>,
    /// Total requests opened.
    requests_total: AtomicU64,
    /// Total requests that matched a rule.
    requests_matched: AtomicU64,
    /// Total requests handed to the native transport.
    requests_unmatched: AtomicU64,
}

impl MockXhr {
    /// Create an environment with the default collaborators and no rules.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            registry: Registry::new(),
            transport: Box::new(UnavailableTransport),
            expander: Box::new(HandlebarsExpander::new()),
            compiler: Box::new(PathTemplateCompiler),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        }
    }

    /// Create an environment from configuration, registering its rules.
    pub fn from_config(config: &MockXhrConfig) -> Result<Self, XhrError> {
        let mock = Self::new(config.settings.clone());
        mock.register_definitions(&config.rules)?;
        info!(rules = mock.registry.len(), "Mock environment initialized");
        Ok(mock)
    }

    /// Create from a YAML configuration string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config = MockXhrConfig::from_yaml(yaml)?;
        Ok(Self::from_config(&config)?)
    }

    /// Use a native transport for requests that match no rule.
    pub fn with_transport(mut self, transport: impl NativeTransport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Replace the static template expander.
    pub fn with_expander(mut self, expander: impl TemplateExpander + 'static) -> Self {
        self.expander = Box::new(expander);
        self
    }

    /// Replace the path template compiler. Affects rules registered afterwards.
    pub fn with_path_compiler(mut self, compiler: impl PathCompiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    /// Merge new settings over the current ones and return the result.
    pub fn setup(&self, update: SettingsUpdate) -> Settings {
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.merge(update);
        debug!(settings = ?*settings, "Settings updated");
        settings.clone()
    }

    /// Current settings.
    pub fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Register a rule.
    pub fn mock(&self, rule: MockRule) -> Result<Arc<MockRule>, XhrError> {
        let rule = self.registry.register(rule, self.compiler.as_ref())?;
        debug!(rule = %rule.label(), position = self.registry.len(), "Rule registered");
        Ok(rule)
    }

    /// Register rules from configuration definitions.
    pub fn register_definitions(&self, rules: &[RuleDefinition]) -> Result<(), XhrError> {
        for definition in rules {
            self.mock(definition.to_rule()?)?;
        }
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Create a new request bound to this environment.
    pub fn request(self: &Arc<Self>) -> XmlHttpRequest {
        XmlHttpRequest::new(Arc::clone(self))
    }

    /// Get total requests opened.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests matched.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    /// Get total requests passed to the native transport.
    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    /// Look up the rule for a request, updating counters and logging.
    pub(crate) fn find_rule(&self, method: &str, url: &str) -> Option<RuleMatch> {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        let settings = self.settings();

        match self.registry.find(method, url) {
            Some(found) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if settings.log_matches {
                    info!(rule = %found.rule.label(), method = %method, url = %url, "Request matched rule");
                }
                Some(found)
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if settings.log_unmatched {
                    warn!(method = %method, url = %url, "No matching rule, using native transport");
                }
                None
            }
        }
    }

    pub(crate) fn transport(&self) -> &dyn NativeTransport {
        self.transport.as_ref()
    }

    pub(crate) fn expander(&self) -> &dyn TemplateExpander {
        self.expander.as_ref()
    }
}

impl Default for MockXhr {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
