//! Mock XHR
//!
//! A drop-in substitute for the browser request object that answers
//! matching requests from registered rules and hands everything else to a
//! native transport.
//!
//! # Features
//!
//! - **Rule Matching**: Match by exact URL, URL plus query string, path
//!   template (`/user/:id`), or regex, with an optional method pattern
//! - **Static Responses**: Return fixed JSON bodies for matched requests
//! - **Dynamic Templates**: Handlebars helpers in static bodies, or a
//!   function receiving the full request context
//! - **Latency Simulation**: Fixed or uniformly random completion delays
//! - **Lifecycle Replay**: Mocked requests emit the same events in the same
//!   order as a real request
//! - **Transparent Bypass**: Unmatched requests are proxied to a native
//!   request whose events and response properties are mirrored
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   timeout: "10-100"
//! rules:
//!   - name: user-by-id
//!     url: /api/user/:id
//!     method: get
//!     headers:
//!       Content-Type: application/json
//!     response:
//!       id: "{{random 1 1000}}"
//!       name: "ada"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mock_xhr::{MockXhr, OpenOptions};
//!
//! let mock = Arc::new(MockXhr::from_yaml("rules: [{url: /ping, response: {ok: true}}]").unwrap());
//! let xhr = mock.request();
//! xhr.open_with("GET", "/ping", OpenOptions::synchronous()).unwrap();
//! xhr.send(None).unwrap();
//! assert_eq!(xhr.status(), 200);
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod matcher;
pub mod mock;
pub mod registry;
pub mod template;
pub mod transport;
pub mod xhr;

pub use config::{MockXhrConfig, RuleDefinition, Settings, SettingsUpdate, TimeoutSetting};
pub use context::{RequestContext, RequestHeaders};
pub use error::XhrError;
pub use event::{handler, Event, EventHandler, EventKind};
pub use matcher::{MethodPattern, PathCompiler, PathTemplateCompiler, UrlPattern};
pub use mock::MockXhr;
pub use registry::{MockRule, ResponseTemplate, RuleMatch};
pub use template::{HandlebarsExpander, TemplateExpander};
pub use transport::{NativeRequest, NativeTransport, RequestProperty, ResponseProperty};
pub use xhr::{OpenOptions, ReadyState, ResponseType, XmlHttpRequest};
