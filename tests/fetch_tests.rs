//! End-to-end fetch tests against a local HTTP server
//!
//! Each test binds an ephemeral port on 127.0.0.1, so they run without
//! network access.

mod common;

use common::*;
use mercury::event_loop::Settlement;
use mercury::{AbortController, RequestInit, Response, RuntimeConfig, Value, Window};
use std::cell::RefCell;
use std::rc::Rc;

fn fulfilled(slot: &Rc<RefCell<Option<Settlement>>>) -> Value {
    match slot.borrow().clone() {
        Some(Ok(value)) => value,
        Some(Err(reason)) => panic!("expected fulfillment, got rejection: {}", reason),
        None => panic!("promise still pending"),
    }
}

fn rejected(slot: &Rc<RefCell<Option<Settlement>>>) -> Value {
    match slot.borrow().clone() {
        Some(Err(reason)) => reason,
        Some(Ok(value)) => panic!("expected rejection, got: {}", value),
        None => panic!("promise still pending"),
    }
}

#[test]
fn test_fetch_resolves_with_response() {
    let (url, server) = serve_once(
        "HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\nX-Custom: yes\r\nContent-Length: 5\r\n\r\nhello",
    );
    let window = system_window();
    let sched = window.scheduler().clone();

    let headers = Value::new_object_with_properties([("X-Test", Value::from("1"))]);
    let init = Value::new_object_with_properties([
        ("method", Value::from("post")),
        ("headers", headers),
        ("body", Value::from("payload")),
    ]);
    let promise = window
        .global()
        .call_method("fetch", &[Value::from(url.as_str()), init])
        .unwrap()
        .as_promise()
        .unwrap();
    let slot = settlement_of(&sched, &promise);
    sched.run_until(|| slot.borrow().is_some()).unwrap();

    let response = fulfilled(&slot);
    assert_eq!(response.get("status").to_number(), 201.0);
    assert_eq!(response.get("statusText").to_js_string(), "Created");
    assert!(response.get("ok").to_boolean());
    let custom = response.get("headers").call_method("get", &[Value::from("x-custom")]).unwrap();
    assert_eq!(custom.to_js_string(), "yes");

    let text = response.call_method("text", &[]).unwrap().as_promise().unwrap();
    let body = settlement_of(&sched, &text);
    sched.run_until_idle().unwrap();
    assert_eq!(fulfilled(&body).to_js_string(), "hello");
    assert!(response.get("bodyUsed").to_boolean());

    let request = server.join().unwrap();
    assert!(request.starts_with("POST / HTTP/1.1\r\n"));
    assert!(request.to_ascii_lowercase().contains("x-test: 1"));
}

#[test]
fn test_json_body() {
    let (url, server) = serve_once(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 17\r\n\r\n{\"n\":1,\"s\":\"ok\"}\n",
    );
    let window = system_window();
    let sched = window.scheduler().clone();
    let promise = window.fetch(&url, RequestInit::default());
    let slot = settlement_of(&sched, &promise);
    sched.run_until(|| slot.borrow().is_some()).unwrap();

    let response = fulfilled(&slot).host_data::<Response>().unwrap();
    let json = settlement_of(&sched, &response.json(&sched));
    sched.run_until_idle().unwrap();
    let value = fulfilled(&json);
    assert_eq!(value.get("n").to_number(), 1.0);
    assert_eq!(value.get("s").to_js_string(), "ok");
    server.join().unwrap();
}

#[test]
fn test_abort_right_after_fetch_rejects_with_reason() {
    let (url, _server) = serve_silently();
    let window = system_window();
    let sched = window.scheduler().clone();
    let controller = AbortController::new();

    let promise = window.fetch(
        &url,
        RequestInit {
            signal: Some(controller.signal().clone()),
            ..Default::default()
        },
    );
    let slot = settlement_of(&sched, &promise);
    controller.abort(&sched, Some(Value::from("user left")));
    sched.run_until(|| slot.borrow().is_some()).unwrap();

    assert_eq!(rejected(&slot).to_js_string(), "user left");
    // The background thread notices the cancel and the scheduler drains.
    sched.run_until_idle().unwrap();
    assert_eq!(window.bridge().in_flight(), 0);
}

#[test]
fn test_pre_aborted_signal_from_script() {
    let window = system_window();
    let sched = window.scheduler().clone();
    let global = window.global();
    let signal = global.get("AbortSignal").call_method("abort", &[]).unwrap();
    let init = Value::new_object_with_properties([("signal", signal)]);
    let promise = global
        .call_method("fetch", &[Value::from("http://127.0.0.1:9/"), init])
        .unwrap()
        .as_promise()
        .unwrap();
    let slot = settlement_of(&sched, &promise);
    sched.run_until_idle().unwrap();
    assert_eq!(rejected(&slot).error_name().as_deref(), Some("AbortError"));
}

#[test]
fn test_connection_refused_is_type_error() {
    // Bind then drop to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let window = system_window();
    let sched = window.scheduler().clone();
    let promise = window.fetch(&format!("http://127.0.0.1:{}/", port), RequestInit::default());
    let slot = settlement_of(&sched, &promise);
    sched.run_until(|| slot.borrow().is_some()).unwrap();
    assert_eq!(rejected(&slot).error_name().as_deref(), Some("TypeError"));
}

#[test]
fn test_unsupported_scheme_is_type_error() {
    let window = system_window();
    let sched = window.scheduler().clone();
    let promise = window.fetch("https://example.invalid/", RequestInit::default());
    let slot = settlement_of(&sched, &promise);
    sched.run_until(|| slot.borrow().is_some()).unwrap();
    assert_eq!(rejected(&slot).error_name().as_deref(), Some("TypeError"));
}

#[test]
fn test_oversized_content_length_rejects() {
    let (url, server) = serve_once("HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc");
    let window = system_window();
    let sched = window.scheduler().clone();
    let promise = window.fetch(&url, RequestInit::default());
    let slot = settlement_of(&sched, &promise);
    sched.run_until(|| slot.borrow().is_some()).unwrap();
    assert_eq!(rejected(&slot).error_name().as_deref(), Some("TypeError"));
    sched.run_until_idle().unwrap();
    assert!(!sched.has_pending_work());
    server.join().unwrap();
}

#[test]
fn test_timeout_signal_rejects_with_timeout_error() {
    let (url, _server) = serve_silently();
    let (sched, clock) = manual_scheduler();
    let window = Window::new(sched.clone(), RuntimeConfig::default()).unwrap();
    let global = window.global();
    let signal = global
        .get("AbortSignal")
        .call_method("timeout", &[Value::Number(50.0)])
        .unwrap();
    let init = Value::new_object_with_properties([("signal", signal)]);
    let promise = global
        .call_method("fetch", &[Value::from(url.as_str()), init])
        .unwrap()
        .as_promise()
        .unwrap();
    let slot = settlement_of(&sched, &promise);

    sched.tick();
    assert!(slot.borrow().is_none());
    clock.advance(50);
    sched.run_until(|| slot.borrow().is_some()).unwrap();

    let reason = rejected(&slot);
    assert_eq!(reason.error_name().as_deref(), Some("TimeoutError"));
    sched.run_until_idle().unwrap();
    assert_eq!(window.bridge().in_flight(), 0);
}
