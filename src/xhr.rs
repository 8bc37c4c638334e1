//! The request facade.
//!
//! [`XmlHttpRequest`] mirrors the browser request object. On `open` it asks
//! the environment for a matching rule exactly once: with no match every
//! operation is proxied to a native request whose events are mirrored back;
//! with a match the facade replays the request lifecycle itself and
//! synthesizes the response from the rule's template.

use crate::config::TimeoutSetting;
use crate::context::RequestContext;
use crate::error::XhrError;
use crate::event::{Event, EventHandler, EventKind, Listeners};
use crate::mock::MockXhr;
use crate::registry::MockRule;
use crate::template;
use crate::transport::{NativeRequest, RequestProperty, ResponseProperty};
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Request header added to every mocked request.
pub const MOCK_MARKER_HEADER: &str = "X-Requested-With";
/// Value of [`MOCK_MARKER_HEADER`].
pub const MOCK_MARKER_VALUE: &str = "MockXMLHttpRequest";

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ReadyState {
    #[default]
    Unsent = 0,
    Opened = 1,
    HeadersReceived = 2,
    Loading = 3,
    Done = 4,
}

impl ReadyState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(ReadyState::Unsent),
            1 => Some(ReadyState::Opened),
            2 => Some(ReadyState::HeadersReceived),
            3 => Some(ReadyState::Loading),
            4 => Some(ReadyState::Done),
            _ => None,
        }
    }
}

/// Requested representation of the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Default,
    Text,
    ArrayBuffer,
    Blob,
    Document,
    Json,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Default => "",
            ResponseType::Text => "text",
            ResponseType::ArrayBuffer => "arraybuffer",
            ResponseType::Blob => "blob",
            ResponseType::Document => "document",
            ResponseType::Json => "json",
        }
    }
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(ResponseType::Default),
            "text" => Ok(ResponseType::Text),
            "arraybuffer" => Ok(ResponseType::ArrayBuffer),
            "blob" => Ok(ResponseType::Blob),
            "document" => Ok(ResponseType::Document),
            "json" => Ok(ResponseType::Json),
            other => Err(format!("unknown response type: {}", other)),
        }
    }
}

/// Arguments of `open` beyond method and URL.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub asynchronous: bool,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            asynchronous: true,
            user: None,
            password: None,
        }
    }
}

impl OpenOptions {
    pub fn synchronous() -> Self {
        Self {
            asynchronous: false,
            ..Self::default()
        }
    }

    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }
}

/// Which way this request goes, decided once per `open`.
enum Strategy {
    Idle,
    Bypass(Arc<dyn NativeRequest>),
    Mocked(Arc<MockRule>),
}

#[derive(Default)]
struct State {
    ready_state: ReadyState,
    strategy: Option<Strategy>,
    context: RequestContext,
    sent: bool,
    /// Bumped on every open and mocked abort; stale completions compare it.
    generation: u64,
    pending: Option<JoinHandle<Result<(), XhrError>>>,
    delay_override: Option<TimeoutSetting>,

    status: u16,
    status_text: String,
    response_url: String,
    response_type: ResponseType,
    response: Option<Value>,
    response_text: String,
    response_headers: Vec<(String, String)>,

    timeout_ms: u64,
    with_credentials: bool,
    mime_override: Option<String>,
}

impl State {
    fn strategy(&self) -> &Strategy {
        self.strategy.as_ref().unwrap_or(&Strategy::Idle)
    }

    fn native(&self) -> Option<Arc<dyn NativeRequest>> {
        match self.strategy() {
            Strategy::Bypass(native) => Some(Arc::clone(native)),
            _ => None,
        }
    }

    fn reset_response(&mut self) {
        self.ready_state = ReadyState::Unsent;
        self.status = 0;
        self.status_text.clear();
        self.response_url.clear();
        self.response = None;
        self.response_text.clear();
        self.response_headers.clear();
    }

    fn apply_native_property(&mut self, property: ResponseProperty, value: Value) -> bool {
        match property {
            ResponseProperty::ReadyState => match value.as_u64().and_then(ReadyState::from_u64) {
                Some(ready_state) => self.ready_state = ready_state,
                None => return false,
            },
            ResponseProperty::Status => match value.as_u64().and_then(|s| u16::try_from(s).ok()) {
                Some(status) => self.status = status,
                None => return false,
            },
            ResponseProperty::StatusText => match value.as_str() {
                Some(text) => self.status_text = text.to_string(),
                None => return false,
            },
            ResponseProperty::ResponseUrl => match value.as_str() {
                Some(url) => self.response_url = url.to_string(),
                None => return false,
            },
            ResponseProperty::ResponseType => match value.as_str().map(str::parse::<ResponseType>) {
                Some(Ok(response_type)) => self.response_type = response_type,
                _ => return false,
            },
            ResponseProperty::ResponseText => match value.as_str() {
                Some(text) => self.response_text = text.to_string(),
                None => return false,
            },
            ResponseProperty::Response => {
                self.response = (!value.is_null()).then_some(value);
            }
        }
        true
    }
}

struct Inner {
    mock: Arc<MockXhr>,
    state: Mutex<State>,
    listeners: Mutex<Listeners>,
}

/// Drop-in substitute for the browser request object.
///
/// Cloning yields another handle to the same request. Locks are never held
/// while handlers or native calls run, so handlers may call back into the
/// request (including `abort`).
#[derive(Clone)]
pub struct XmlHttpRequest {
    inner: Arc<Inner>,
}

impl XmlHttpRequest {
    pub const UNSENT: u8 = ReadyState::Unsent as u8;
    pub const OPENED: u8 = ReadyState::Opened as u8;
    pub const HEADERS_RECEIVED: u8 = ReadyState::HeadersReceived as u8;
    pub const LOADING: u8 = ReadyState::Loading as u8;
    pub const DONE: u8 = ReadyState::Done as u8;

    pub(crate) fn new(mock: Arc<MockXhr>) -> Self {
        Self {
            inner: Arc::new(Inner {
                mock,
                state: Mutex::new(State::default()),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open an asynchronous request.
    pub fn open(&self, method: &str, url: &str) -> Result<(), XhrError> {
        self.open_with(method, url, OpenOptions::default())
    }

    /// Open a request, deciding once whether it is mocked or passed through.
    pub fn open_with(&self, method: &str, url: &str, options: OpenOptions) -> Result<(), XhrError> {
        let mock = &self.inner.mock;
        let delay_override = self.state().delay_override.clone();
        let delay_ms = match delay_override {
            Some(setting) => setting.resolve(),
            None => mock.settings().timeout.resolve(),
        };

        let found = mock.find_rule(method, url);

        let mut context = RequestContext {
            method: method.to_string(),
            url: url.to_string(),
            timeout_ms: delay_ms,
            asynchronous: options.asynchronous,
            user: options.user.clone(),
            password: options.password.clone(),
            ..Default::default()
        };

        let Some(found) = found else {
            return self.open_native(context, options);
        };
        context.params = found.params;

        {
            let mut state = self.state();
            let generation = self.restart(&mut state, context);
            debug!(generation, delay_ms, rule = %found.rule.label(), "Opened mocked request");
            state.strategy = Some(Strategy::Mocked(found.rule));
            state.ready_state = ReadyState::Opened;
        }
        self.dispatch_event(EventKind::ReadyStateChange);
        Ok(())
    }

    /// Reset per-request state for a new open and return the new generation.
    fn restart(&self, state: &mut State, context: RequestContext) -> u64 {
        state.generation += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        state.reset_response();
        state.strategy = Some(Strategy::Idle);
        state.context = context;
        state.sent = false;
        state.generation
    }

    fn open_native(&self, context: RequestContext, options: OpenOptions) -> Result<(), XhrError> {
        // The previous request is cancelled even if construction fails below
        let generation = self.restart(&mut self.state(), context.clone());

        let native = self
            .inner
            .mock
            .transport()
            .create()
            .map_err(XhrError::Native)?;

        let (timeout_ms, with_credentials) = {
            let mut state = self.state();
            if state.generation != generation {
                return Ok(());
            }
            state.strategy = Some(Strategy::Bypass(Arc::clone(&native)));
            (state.timeout_ms, state.with_credentials)
        };

        for kind in EventKind::ALL {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            native.add_event_listener(
                kind,
                Box::new(move |native_kind| {
                    if let Some(inner) = weak.upgrade() {
                        XmlHttpRequest { inner }.mirror_native_event(generation, native_kind);
                    }
                }),
            );
        }

        // Credentials only go along when a user was given
        let password = context.user.as_ref().and(context.password.as_deref());
        native
            .open(
                &context.method,
                &context.url,
                context.asynchronous,
                context.user.as_deref(),
                password,
            )
            .map_err(XhrError::Native)?;

        forward_property(native.as_ref(), RequestProperty::Timeout, Value::from(timeout_ms));
        forward_property(
            native.as_ref(),
            RequestProperty::WithCredentials,
            Value::from(with_credentials),
        );
        debug!(generation, asynchronous = options.asynchronous, "Opened native request");
        Ok(())
    }

    /// Copy response properties from the native request, then re-emit the event.
    fn mirror_native_event(&self, generation: u64, kind: EventKind) {
        let native = {
            let state = self.state();
            if state.generation != generation {
                return;
            }
            match state.native() {
                Some(native) => native,
                None => return,
            }
        };

        let mut copied = Vec::with_capacity(ResponseProperty::ALL.len());
        for property in ResponseProperty::ALL {
            match native.property(property) {
                Ok(value) => copied.push((property, value)),
                Err(e) => trace!(?property, error = %e, "Skipping unreadable native property"),
            }
        }

        {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            for (property, value) in copied {
                if !state.apply_native_property(property, value) {
                    trace!(?property, "Skipping native property with unexpected type");
                }
            }
        }

        self.dispatch_event(kind);
    }

    /// Add a request header.
    ///
    /// Mocked requests join a repeated header name with a comma.
    pub fn set_request_header(&self, name: &str, value: &str) -> Result<(), XhrError> {
        let native = {
            let mut state = self.state();
            match state.strategy() {
                Strategy::Idle => {
                    return Err(XhrError::InvalidState("set_request_header() called before open()"))
                }
                Strategy::Bypass(native) => Arc::clone(native),
                Strategy::Mocked(_) => {
                    if state.ready_state != ReadyState::Opened || state.sent {
                        return Err(XhrError::InvalidState(
                            "set_request_header() called after send() or abort()",
                        ));
                    }
                    state.context.headers.append(name, value);
                    return Ok(());
                }
            }
        };
        native.set_request_header(name, value).map_err(XhrError::Native)
    }

    /// Send the request.
    ///
    /// A synchronous mocked request completes before this returns and any
    /// synthesis failure is returned here. An asynchronous one completes after
    /// the computed delay; use [`XmlHttpRequest::wait`] to observe it.
    pub fn send(&self, body: Option<&str>) -> Result<(), XhrError> {
        let (generation, asynchronous, delay_ms, runtime) = {
            let mut state = self.state();
            match state.strategy() {
                Strategy::Idle => return Err(XhrError::InvalidState("send() called before open()")),
                Strategy::Bypass(native) => {
                    let native = Arc::clone(native);
                    state.context.body = body.map(str::to_string);
                    state.sent = true;
                    drop(state);
                    return native.send(body).map_err(XhrError::Native);
                }
                Strategy::Mocked(_) => {}
            }

            if state.ready_state != ReadyState::Opened || state.sent {
                return Err(XhrError::InvalidState("send() called twice or after abort()"));
            }
            let asynchronous = state.context.asynchronous;
            let runtime = if asynchronous {
                Some(tokio::runtime::Handle::try_current().map_err(|_| XhrError::NoRuntime)?)
            } else {
                None
            };

            state.sent = true;
            state.context.body = body.map(str::to_string);
            state
                .context
                .headers
                .append(MOCK_MARKER_HEADER, MOCK_MARKER_VALUE);
            (state.generation, asynchronous, state.context.timeout_ms, runtime)
        };

        self.dispatch_event(EventKind::LoadStart);

        match runtime {
            Some(runtime) if asynchronous => {
                if !self.is_current(generation) {
                    return Ok(());
                }
                let request = self.clone();
                let task = runtime.spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    request.complete(generation)
                });
                let mut state = self.state();
                if state.generation == generation {
                    state.pending = Some(task);
                } else {
                    task.abort();
                }
                Ok(())
            }
            _ => self.complete(generation),
        }
    }

    /// Wait for a pending asynchronous completion and return its outcome.
    ///
    /// Returns immediately when nothing is pending, including after `abort`.
    pub async fn wait(&self) -> Result<(), XhrError> {
        let pending = self.state().pending.take();
        match pending {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    /// Run the completion sequence of a mocked request.
    ///
    /// Every step re-checks the generation, so an abort (or reopen) before or
    /// during the sequence stops it.
    fn complete(&self, generation: u64) -> Result<(), XhrError> {
        let (rule, context) = {
            let state = self.state();
            if state.generation != generation {
                return Ok(());
            }
            match state.strategy() {
                Strategy::Mocked(rule) => (Arc::clone(rule), state.context.clone()),
                _ => return Ok(()),
            }
        };

        let synthesized = template::synthesize(&rule, &context, self.inner.mock.expander())
            .and_then(|body| template::format_body(&body).map(|text| (body, text)));
        let (body, text) = match synthesized {
            Ok(output) => output,
            Err(e) => {
                warn!(rule = %rule.label(), url = %context.url, error = %e, "Response synthesis failed");
                self.emit_if_current(generation, EventKind::Error);
                self.emit_if_current(generation, EventKind::LoadEnd);
                return Err(e);
            }
        };

        let headers = rule.headers().to_vec();
        if !self.advance(generation, ReadyState::HeadersReceived, |state| {
            state.response_headers = headers;
        }) {
            return Ok(());
        }
        if !self.advance(generation, ReadyState::Loading, |_| {}) {
            return Ok(());
        }
        let url = context.url.clone();
        if !self.advance(generation, ReadyState::Done, |state| {
            state.status = 200;
            state.status_text = "OK".to_string();
            state.response = Some(body);
            state.response_text = text;
            state.response_url = url;
        }) {
            return Ok(());
        }

        debug!(rule = %rule.label(), url = %context.url, "Mocked request completed");
        self.emit_if_current(generation, EventKind::Load);
        self.emit_if_current(generation, EventKind::LoadEnd);
        Ok(())
    }

    /// Move to `ready_state` and emit `readystatechange`, unless superseded.
    fn advance(&self, generation: u64, ready_state: ReadyState, update: impl FnOnce(&mut State)) -> bool {
        {
            let mut state = self.state();
            if state.generation != generation {
                return false;
            }
            update(&mut state);
            state.ready_state = ready_state;
        }
        self.dispatch_event(EventKind::ReadyStateChange);
        true
    }

    fn emit_if_current(&self, generation: u64, kind: EventKind) {
        if self.is_current(generation) {
            self.dispatch_event(kind);
        }
    }

    /// Abort the request.
    ///
    /// A mocked request returns to `Unsent`, emits `abort` then `error`, and
    /// its pending completion never runs.
    pub fn abort(&self) -> Result<(), XhrError> {
        let native = {
            let mut state = self.state();
            match state.strategy() {
                Strategy::Idle => return Ok(()),
                Strategy::Bypass(native) => Arc::clone(native),
                Strategy::Mocked(_) => {
                    state.generation += 1;
                    if let Some(pending) = state.pending.take() {
                        pending.abort();
                    }
                    state.ready_state = ReadyState::Unsent;
                    debug!(generation = state.generation, "Mocked request aborted");
                    drop(state);
                    self.dispatch_event(EventKind::Abort);
                    self.dispatch_event(EventKind::Error);
                    return Ok(());
                }
            }
        };
        native.abort().map_err(XhrError::Native)
    }

    /// Case-insensitive response header lookup.
    pub fn get_response_header(&self, name: &str) -> Option<String> {
        let native = {
            let state = self.state();
            match state.strategy() {
                Strategy::Bypass(native) => Arc::clone(native),
                _ => {
                    return state
                        .response_headers
                        .iter()
                        .find(|(header, _)| header.eq_ignore_ascii_case(name))
                        .map(|(_, value)| value.clone())
                }
            }
        };
        native.get_response_header(name)
    }

    /// All response headers as `name: value\r\n` lines, in insertion order.
    pub fn get_all_response_headers(&self) -> String {
        let native = {
            let state = self.state();
            match state.strategy() {
                Strategy::Bypass(native) => Arc::clone(native),
                _ => {
                    return state
                        .response_headers
                        .iter()
                        .map(|(name, value)| format!("{}: {}\r\n", name, value))
                        .collect()
                }
            }
        };
        native.get_all_response_headers()
    }

    /// Override the response MIME type. Recorded locally, forwarded on bypass.
    pub fn override_mime_type(&self, mime: &str) -> Result<(), XhrError> {
        let native = {
            let mut state = self.state();
            state.mime_override = Some(mime.to_string());
            state.native()
        };
        match native {
            Some(native) => native.override_mime_type(mime).map_err(XhrError::Native),
            None => Ok(()),
        }
    }

    pub fn add_event_listener(&self, kind: EventKind, handler: EventHandler) {
        self.listeners().add(kind, handler);
    }

    /// Remove every registration of `handler` for `kind`.
    pub fn remove_event_listener(&self, kind: EventKind, handler: &EventHandler) {
        self.listeners().remove(kind, handler);
    }

    /// Set or clear the `on<kind>` handler, which runs after all listeners.
    pub fn set_event_handler(&self, kind: EventKind, handler: Option<EventHandler>) {
        self.listeners().set_slot(kind, handler);
    }

    pub fn event_handler(&self, kind: EventKind) -> Option<EventHandler> {
        self.listeners().slot(kind)
    }

    /// Invoke the listeners for `kind` in registration order, then the slot handler.
    pub fn dispatch_event(&self, kind: EventKind) {
        let handlers = self.listeners().handlers(kind);
        if handlers.is_empty() {
            return;
        }
        let event = Event::new(kind, self.clone());
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.state().ready_state
    }

    pub fn status(&self) -> u16 {
        self.state().status
    }

    pub fn status_text(&self) -> String {
        self.state().status_text.clone()
    }

    pub fn response_text(&self) -> String {
        self.state().response_text.clone()
    }

    /// The response in the representation selected by `response_type`.
    ///
    /// A mocked response is the structured body for `json` and the formatted
    /// text otherwise; `None` until the request is done.
    pub fn response(&self) -> Option<Value> {
        let state = self.state();
        match state.strategy() {
            Strategy::Mocked(_) if state.ready_state != ReadyState::Done => None,
            Strategy::Mocked(_) if state.response_type == ResponseType::Json => state.response.clone(),
            Strategy::Mocked(_) => Some(Value::String(state.response_text.clone())),
            _ => state.response.clone(),
        }
    }

    pub fn response_url(&self) -> String {
        self.state().response_url.clone()
    }

    pub fn response_type(&self) -> ResponseType {
        self.state().response_type
    }

    pub fn set_response_type(&self, response_type: ResponseType) {
        let native = {
            let mut state = self.state();
            state.response_type = response_type;
            state.native()
        };
        if let Some(native) = native {
            forward_property(
                native.as_ref(),
                RequestProperty::ResponseType,
                Value::from(response_type.as_str()),
            );
        }
    }

    /// Request timeout property, forwarded to a native request.
    pub fn timeout(&self) -> u64 {
        self.state().timeout_ms
    }

    pub fn set_timeout(&self, timeout_ms: u64) {
        let native = {
            let mut state = self.state();
            state.timeout_ms = timeout_ms;
            state.native()
        };
        if let Some(native) = native {
            forward_property(native.as_ref(), RequestProperty::Timeout, Value::from(timeout_ms));
        }
    }

    pub fn with_credentials(&self) -> bool {
        self.state().with_credentials
    }

    pub fn set_with_credentials(&self, with_credentials: bool) {
        let native = {
            let mut state = self.state();
            state.with_credentials = with_credentials;
            state.native()
        };
        if let Some(native) = native {
            forward_property(
                native.as_ref(),
                RequestProperty::WithCredentials,
                Value::from(with_credentials),
            );
        }
    }

    /// Override the environment's delay setting for the next `open`.
    pub fn set_mock_delay(&self, delay: Option<TimeoutSetting>) {
        self.state().delay_override = delay;
    }

    /// Delay computed by the last `open`.
    pub fn mock_delay(&self) -> Duration {
        Duration::from_millis(self.state().context.timeout_ms)
    }

    /// Whether the last `open` matched a rule.
    pub fn is_mocked(&self) -> bool {
        matches!(self.state().strategy(), Strategy::Mocked(_))
    }

    /// Rule matched by the last `open`, if any.
    pub fn matched_rule(&self) -> Option<Arc<MockRule>> {
        match self.state().strategy() {
            Strategy::Mocked(rule) => Some(Arc::clone(rule)),
            _ => None,
        }
    }

    /// Snapshot of the request context.
    pub fn request_context(&self) -> RequestContext {
        self.state().context.clone()
    }

    pub fn mime_override(&self) -> Option<String> {
        self.state().mime_override.clone()
    }
}

/// Best-effort property write; some transports reject writes after open.
fn forward_property(native: &dyn NativeRequest, property: RequestProperty, value: Value) {
    if let Err(e) = native.set_property(property, value) {
        trace!(?property, error = %e, "Native request rejected property");
    }
}
