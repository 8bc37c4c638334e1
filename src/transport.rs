//! Native transport seam.
//!
//! Requests that match no rule are handed to a [`NativeRequest`] created by
//! the environment's [`NativeTransport`]. Its events are mirrored onto the
//! facade; the facade never hands its own listeners to the native request.

use crate::event::EventKind;
use serde_json::Value;
use std::sync::Arc;

/// Response properties copied from a native request on every native event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseProperty {
    ReadyState,
    ResponseUrl,
    Status,
    StatusText,
    ResponseType,
    Response,
    ResponseText,
}

impl ResponseProperty {
    pub const ALL: [ResponseProperty; 7] = [
        ResponseProperty::ReadyState,
        ResponseProperty::ResponseUrl,
        ResponseProperty::Status,
        ResponseProperty::StatusText,
        ResponseProperty::ResponseType,
        ResponseProperty::Response,
        ResponseProperty::ResponseText,
    ];
}

/// Request properties forwarded from the facade to a native request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestProperty {
    Timeout,
    WithCredentials,
    ResponseType,
}

/// Listener attached to a native request; receives the native event kind.
pub type NativeListener = Box<dyn Fn(EventKind) + Send + Sync>;

/// A request on the real network stack.
///
/// Implementations may fire listeners synchronously from within any call.
pub trait NativeRequest: Send + Sync {
    fn add_event_listener(&self, kind: EventKind, listener: NativeListener);

    fn open(
        &self,
        method: &str,
        url: &str,
        asynchronous: bool,
        user: Option<&str>,
        password: Option<&str>,
    ) -> anyhow::Result<()>;

    fn set_property(&self, property: RequestProperty, value: Value) -> anyhow::Result<()>;

    fn set_request_header(&self, name: &str, value: &str) -> anyhow::Result<()>;

    fn override_mime_type(&self, mime: &str) -> anyhow::Result<()>;

    fn send(&self, body: Option<&str>) -> anyhow::Result<()>;

    fn abort(&self) -> anyhow::Result<()>;

    fn get_response_header(&self, name: &str) -> Option<String>;

    fn get_all_response_headers(&self) -> String;

    /// Read a response property. Any property may be unreadable.
    fn property(&self, property: ResponseProperty) -> anyhow::Result<Value>;
}

/// Factory for native requests.
pub trait NativeTransport: Send + Sync {
    fn create(&self) -> anyhow::Result<Arc<dyn NativeRequest>>;
}

/// Transport used when none is configured: every unmatched request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableTransport;

impl NativeTransport for UnavailableTransport {
    fn create(&self) -> anyhow::Result<Arc<dyn NativeRequest>> {
        anyhow::bail!("no native transport configured; request matched no mock rule")
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted native transport for driving the bypass path in tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct ScriptedRequest {
        pub(crate) calls: Mutex<Vec<String>>,
        listeners: Mutex<Vec<(EventKind, Arc<NativeListener>)>>,
        pub(crate) properties: Mutex<HashMap<&'static str, Value>>,
        pub(crate) headers: Mutex<Vec<(String, String)>>,
    }

    fn key(property: ResponseProperty) -> &'static str {
        match property {
            ResponseProperty::ReadyState => "readyState",
            ResponseProperty::ResponseUrl => "responseURL",
            ResponseProperty::Status => "status",
            ResponseProperty::StatusText => "statusText",
            ResponseProperty::ResponseType => "responseType",
            ResponseProperty::Response => "response",
            ResponseProperty::ResponseText => "responseText",
        }
    }

    impl ScriptedRequest {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn set(&self, property: ResponseProperty, value: Value) {
            self.properties.lock().unwrap().insert(key(property), value);
        }

        pub(crate) fn listener_count(&self) -> usize {
            self.listeners.lock().unwrap().len()
        }

        /// Fire a native event the way a browser would.
        pub(crate) fn fire(&self, kind: EventKind) {
            let listeners: Vec<_> = self
                .listeners
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, l)| l.clone())
                .collect();
            for listener in listeners {
                listener(kind);
            }
        }
    }

    impl NativeRequest for ScriptedRequest {
        fn add_event_listener(&self, kind: EventKind, listener: NativeListener) {
            self.listeners.lock().unwrap().push((kind, Arc::new(listener)));
        }

        fn open(
            &self,
            method: &str,
            url: &str,
            asynchronous: bool,
            user: Option<&str>,
            password: Option<&str>,
        ) -> anyhow::Result<()> {
            self.record(format!("open {} {} {} {:?} {:?}", method, url, asynchronous, user, password));
            self.set(ResponseProperty::ReadyState, Value::from(1));
            self.fire(EventKind::ReadyStateChange);
            Ok(())
        }

        fn set_property(&self, property: RequestProperty, value: Value) -> anyhow::Result<()> {
            if property == RequestProperty::WithCredentials {
                anyhow::bail!("withCredentials is read-only after open");
            }
            self.record(format!("set {:?} {}", property, value));
            Ok(())
        }

        fn set_request_header(&self, name: &str, value: &str) -> anyhow::Result<()> {
            self.record(format!("header {}: {}", name, value));
            Ok(())
        }

        fn override_mime_type(&self, mime: &str) -> anyhow::Result<()> {
            self.record(format!("mime {}", mime));
            Ok(())
        }

        fn send(&self, body: Option<&str>) -> anyhow::Result<()> {
            self.record(format!("send {:?}", body));
            Ok(())
        }

        fn abort(&self) -> anyhow::Result<()> {
            self.record("abort".to_string());
            Ok(())
        }

        fn get_response_header(&self, name: &str) -> Option<String> {
            self.headers
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        fn get_all_response_headers(&self) -> String {
            self.headers
                .lock()
                .unwrap()
                .iter()
                .map(|(n, v)| format!("{}: {}\r\n", n, v))
                .collect()
        }

        fn property(&self, property: ResponseProperty) -> anyhow::Result<Value> {
            self.properties
                .lock()
                .unwrap()
                .get(key(property))
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{} is not readable", key(property)))
        }
    }

    /// Hands out scripted requests and remembers them for inspection.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        created: Mutex<Vec<Arc<ScriptedRequest>>>,
        pub(crate) fail: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn last(&self) -> Arc<ScriptedRequest> {
            self.created.lock().unwrap().last().cloned().unwrap()
        }

        pub(crate) fn created(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    impl NativeTransport for ScriptedTransport {
        fn create(&self) -> anyhow::Result<Arc<dyn NativeRequest>> {
            if self.fail {
                anyhow::bail!("native request construction refused");
            }
            let request = Arc::new(ScriptedRequest::default());
            self.created.lock().unwrap().push(request.clone());
            Ok(request)
        }
    }

    impl NativeTransport for Arc<ScriptedTransport> {
        fn create(&self) -> anyhow::Result<Arc<dyn NativeRequest>> {
            self.as_ref().create()
        }
    }
}
