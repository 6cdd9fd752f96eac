//! Request and Response value objects

use super::headers::{headers_value, Headers};
use super::transport::{TransportRequest, TransportResponse};
use crate::abort::AbortSignal;
use crate::error::{messages, Error, Result};
use crate::event_loop::{Promise, TaskScheduler};
use crate::runtime::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use url::Url;

/// How redirects are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedirectMode {
    #[default]
    Follow,
    Error,
    Manual,
}

impl RedirectMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "follow" => Ok(RedirectMode::Follow),
            "error" => Ok(RedirectMode::Error),
            "manual" => Ok(RedirectMode::Manual),
            other => Err(Error::type_error(format!("invalid redirect mode '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectMode::Follow => "follow",
            RedirectMode::Error => "error",
            RedirectMode::Manual => "manual",
        }
    }
}

/// Optional fetch parameters
#[derive(Debug, Clone, Default)]
pub struct RequestInit {
    pub method: Option<String>,
    pub headers: Option<Headers>,
    pub body: Option<Vec<u8>>,
    pub redirect: Option<RedirectMode>,
    pub signal: Option<AbortSignal>,
}

impl RequestInit {
    /// Read an init dictionary from script. `signal` is resolved by the
    /// caller, which knows how signal wrappers are represented.
    pub fn from_value(value: &Value, signal: Option<AbortSignal>) -> Result<Self> {
        let mut init = RequestInit {
            signal,
            ..Default::default()
        };
        if value.is_nullish() {
            return Ok(init);
        }
        let method = value.get_property("method")?;
        if !method.is_nullish() {
            init.method = Some(method.to_js_string());
        }
        let headers = value.get_property("headers")?;
        if !headers.is_nullish() {
            init.headers = Some(Headers::from_value(&headers)?);
        }
        let body = value.get_property("body")?;
        if !body.is_nullish() {
            init.body = Some(body.to_js_string().into_bytes());
        }
        let redirect = value.get_property("redirect")?;
        if !redirect.is_nullish() {
            init.redirect = Some(RedirectMode::parse(&redirect.to_js_string())?);
        }
        Ok(init)
    }
}

/// A validated request
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
    pub redirect: RedirectMode,
    pub signal: Option<AbortSignal>,
}

const FORBIDDEN_METHODS: [&str; 3] = ["CONNECT", "TRACE", "TRACK"];
const NORMALIZED_METHODS: [&str; 6] = ["DELETE", "GET", "HEAD", "OPTIONS", "POST", "PUT"];

impl Request {
    /// Resolve `input` against `base` and apply `init`
    pub fn new(input: &str, base: Option<&Url>, init: RequestInit) -> Result<Self> {
        let url = Url::options()
            .base_url(base)
            .parse(input)
            .map_err(|e| Error::type_error(format!("Failed to parse URL from {}: {}", input, e)))?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(Error::type_error(format!(
                "Request cannot be constructed from a URL that includes credentials: {}",
                input
            )));
        }

        let mut method = init.method.unwrap_or_else(|| "GET".to_string());
        if method.is_empty() || !method.bytes().all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)) {
            return Err(Error::type_error(format!("'{}' is not a valid HTTP method", method)));
        }
        let upper = method.to_ascii_uppercase();
        if FORBIDDEN_METHODS.contains(&upper.as_str()) {
            return Err(Error::type_error(format!("'{}' HTTP method is unsupported", method)));
        }
        if NORMALIZED_METHODS.contains(&upper.as_str()) {
            method = upper;
        }
        if init.body.is_some() && (method == "GET" || method == "HEAD") {
            return Err(Error::type_error(messages::requires(
                "Request with GET/HEAD method",
                "no body",
            )));
        }

        Ok(Request {
            method,
            url,
            headers: init.headers.unwrap_or_default(),
            body: init.body,
            redirect: init.redirect.unwrap_or_default(),
            signal: init.signal,
        })
    }

    pub(crate) fn to_transport(&self) -> TransportRequest {
        TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.to_pairs(),
            body: self.body.clone(),
        }
    }
}

/// A response with a one-shot body
#[derive(Debug)]
pub struct Response {
    status: u16,
    status_text: String,
    headers: Rc<RefCell<Headers>>,
    url: String,
    redirected: bool,
    body: RefCell<Option<Vec<u8>>>,
    body_used: Cell<bool>,
    signal: Option<AbortSignal>,
}

impl Response {
    pub(crate) fn from_transport(response: TransportResponse, signal: Option<AbortSignal>) -> Self {
        let mut headers = Headers::new();
        for (name, value) in &response.headers {
            // The transport only hands out parsed header lines.
            let _ = headers.append(name, value);
        }
        Response {
            status: response.status,
            status_text: response.status_text,
            headers: Rc::new(RefCell::new(headers)),
            url: response.url.to_string(),
            redirected: response.redirected,
            body: RefCell::new(Some(response.body)),
            body_used: Cell::new(false),
            signal,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    /// Status in the 200-299 range
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn redirected(&self) -> bool {
        self.redirected
    }

    pub fn headers(&self) -> Rc<RefCell<Headers>> {
        self.headers.clone()
    }

    pub fn body_used(&self) -> bool {
        self.body_used.get()
    }

    /// Take the body. Fails if it was already consumed, or with the abort
    /// reason if the request's signal has aborted since.
    pub fn consume_body(&self) -> Result<Vec<u8>> {
        if let Some(signal) = &self.signal {
            signal.throw_if_aborted()?;
        }
        if self.body_used.replace(true) {
            return Err(Error::invalid_state(messages::BODY_USED));
        }
        Ok(self.body.borrow_mut().take().unwrap_or_default())
    }

    pub fn text(&self, sched: &TaskScheduler) -> Promise {
        settle_with(sched, self.consume_body().map(|bytes| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }))
    }

    pub fn json(&self, sched: &TaskScheduler) -> Promise {
        settle_with(
            sched,
            self.consume_body().and_then(|bytes| {
                serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map(|json| Value::from_json(&json))
                    .map_err(|e| Error::type_error(format!("invalid JSON body: {}", e)))
            }),
        )
    }

    pub fn bytes(&self, sched: &TaskScheduler) -> Promise {
        settle_with(
            sched,
            self.consume_body().map(|bytes| {
                Value::new_array(bytes.into_iter().map(|b| Value::Number(b as f64)).collect())
            }),
        )
    }

    /// Script-visible `Response` object
    pub fn to_value(self: Rc<Self>, sched: &TaskScheduler) -> Value {
        let value = Value::new_host(self.clone());
        value.define_getter("status", |this| Ok(Value::Number(response_of(this)?.status as f64)));
        value.define_getter("statusText", |this| Ok(Value::from(response_of(this)?.status_text.as_str())));
        value.define_getter("ok", |this| Ok(Value::Boolean(response_of(this)?.ok())));
        value.define_getter("url", |this| Ok(Value::from(response_of(this)?.url.as_str())));
        value.define_getter("redirected", |this| Ok(Value::Boolean(response_of(this)?.redirected)));
        value.define_getter("bodyUsed", |this| Ok(Value::Boolean(response_of(this)?.body_used())));
        let _ = value.set("headers", headers_value(self.headers()));

        for (name, read) in [
            ("text", Response::text as fn(&Response, &TaskScheduler) -> Promise),
            ("json", Response::json),
            ("bytes", Response::bytes),
        ] {
            let weak = sched.weak();
            value.define_method(name, move |this, _| {
                let response = response_of(this)?;
                let sched = weak
                    .upgrade()
                    .ok_or_else(|| Error::invalid_state("scheduler has shut down"))?;
                Ok(read(response.as_ref(), sched.as_ref()).to_value(&sched))
            });
        }
        value
    }
}

fn response_of(this: &Value) -> Result<Rc<Response>> {
    this.host_data::<Response>()
        .ok_or_else(|| Error::type_error("receiver is not a Response"))
}

fn settle_with(sched: &TaskScheduler, result: Result<Value>) -> Promise {
    match result {
        Ok(value) => Promise::resolved(sched, value),
        Err(err) => Promise::rejected(sched, err.to_value()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::event_loop::PromiseState;

    fn transport_response(body: &str) -> TransportResponse {
        TransportResponse {
            status: 201,
            status_text: "Created".to_string(),
            headers: vec![("x-custom".to_string(), "custom-value".to_string())],
            body: body.as_bytes().to_vec(),
            url: Url::parse("http://example.test/").unwrap(),
            redirected: false,
        }
    }

    #[test]
    fn test_relative_url_resolution() {
        let base = Url::parse("http://example.test/dir/page.html").unwrap();
        let request = Request::new("../api?x=1", Some(&base), RequestInit::default()).unwrap();
        assert_eq!(request.url.as_str(), "http://example.test/api?x=1");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn test_method_normalization_and_validation() {
        let init = RequestInit {
            method: Some("post".to_string()),
            body: Some(b"x".to_vec()),
            ..Default::default()
        };
        let request = Request::new("http://example.test/", None, init).unwrap();
        assert_eq!(request.method, "POST");

        let init = RequestInit {
            method: Some("TRACE".to_string()),
            ..Default::default()
        };
        assert!(Request::new("http://example.test/", None, init).is_err());
    }

    #[test]
    fn test_get_with_body_rejected() {
        let init = RequestInit {
            body: Some(b"x".to_vec()),
            ..Default::default()
        };
        let err = Request::new("http://example.test/", None, init).unwrap_err();
        assert!(matches!(err, Error::Type { .. }));
    }

    #[test]
    fn test_bad_url() {
        assert!(Request::new("not a url", None, RequestInit::default()).is_err());
    }

    #[test]
    fn test_body_is_one_shot() {
        let response = Response::from_transport(transport_response("Created"), None);
        assert_eq!(response.consume_body().unwrap(), b"Created".to_vec());
        let err = response.consume_body().unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert!(response.body_used());
    }

    #[test]
    fn test_body_after_abort_rejects_with_reason() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let signal = AbortSignal::new();
        let response = Response::from_transport(transport_response("x"), Some(signal.clone()));
        signal.abort(&sched, Some(Value::from("gone")));
        let promise = response.text(&sched);
        assert!(matches!(promise.state(), PromiseState::Rejected(Value::String(s)) if s == "gone"));
        promise.catch(&sched, Value::new_function("ignore", |_, _| Ok(Value::Undefined)));
    }

    #[test]
    fn test_script_surface() {
        let sched = TaskScheduler::new(SchedulerConfig::default());
        let value = Rc::new(Response::from_transport(transport_response("{\"a\":1}"), None)).to_value(&sched);
        assert_eq!(value.get("status").to_number(), 201.0);
        assert!(value.get("ok").to_boolean());
        let header = value.get("headers").call_method("get", &[Value::from("X-Custom")]).unwrap();
        assert_eq!(header.to_js_string(), "custom-value");
        let json = value.call_method("json", &[]).unwrap().as_promise().unwrap();
        match json.state() {
            PromiseState::Fulfilled(v) => assert_eq!(v.get("a").to_number(), 1.0),
            other => panic!("unexpected state {:?}", other),
        }
        assert!(value.get("bodyUsed").to_boolean());
    }
}
