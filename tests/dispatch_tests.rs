//! Integration tests for event dispatch driven through script wrappers
//!
//! Trees are built with the same calls script would make (`createElement`,
//! `appendChild`, `attachShadow`) and events are dispatched with
//! `dispatchEvent`, so wrapper identity and retargeting are checked end to end.

mod common;

use common::*;
use mercury::Value;
use std::cell::RefCell;
use std::rc::Rc;

fn element(document: &Value, tag: &str) -> Value {
    document.call_method("createElement", &[Value::from(tag)]).unwrap()
}

fn append(parent: &Value, child: &Value) {
    parent.call_method("appendChild", &[child.clone()]).unwrap();
}

fn listen(target: &Value, event_type: &str, listener: Value, options: Value) {
    target
        .call_method("addEventListener", &[Value::from(event_type), listener, options])
        .unwrap();
}

fn new_event(global: &Value, event_type: &str, bubbles: bool, composed: bool) -> Value {
    let init = Value::new_object_with_properties([
        ("bubbles", Value::Boolean(bubbles)),
        ("composed", Value::Boolean(composed)),
        ("cancelable", Value::Boolean(true)),
    ]);
    global.call_method("Event", &[Value::from(event_type), init]).unwrap()
}

/// Listener logging `tag:eventPhase`
fn phase_logger(log: &Log, tag: &str) -> Value {
    let log = log.clone();
    let tag = tag.to_string();
    Value::new_function("phase", move |_, args| {
        let phase = args[0].get("eventPhase").to_number();
        log.borrow_mut().push(format!("{}:{}", tag, phase));
        Ok(Value::Undefined)
    })
}

mod propagation {
    use super::*;

    #[test]
    fn test_full_path_through_window() {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let html = element(&document, "html");
        let body = element(&document, "body");
        append(&document, &html);
        append(&html, &body);

        let log = log();
        let capture = Value::Boolean(true);
        listen(&global, "ping", phase_logger(&log, "window-capture"), capture.clone());
        listen(&global, "ping", phase_logger(&log, "window"), Value::Undefined);
        listen(&document, "ping", phase_logger(&log, "document-capture"), capture.clone());
        listen(&html, "ping", phase_logger(&log, "html"), Value::Undefined);
        listen(&body, "ping", phase_logger(&log, "body"), Value::Undefined);
        listen(&body, "ping", phase_logger(&log, "body-capture"), capture);

        let event = new_event(&global, "ping", true, false);
        assert!(body.call_method("dispatchEvent", &[event.clone()]).unwrap().to_boolean());

        assert_eq!(
            *log.borrow(),
            vec![
                "window-capture:1",
                "document-capture:1",
                "body:2",
                "body-capture:2",
                "html:3",
                "window:3",
            ]
        );
        assert_eq!(event.get("eventPhase").to_number(), 0.0);
        assert!(event.get("currentTarget").is_nullish());
        assert!(event.get("target").strict_equals(&body));
    }

    #[test]
    fn test_load_never_reaches_window() {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let log = log();
        listen(&global, "load", recorder(&log, "window"), Value::Undefined);
        listen(&document, "load", recorder(&log, "document"), Value::Undefined);

        let event = new_event(&global, "load", true, false);
        document.call_method("dispatchEvent", &[event]).unwrap();
        assert_eq!(*log.borrow(), vec!["document"]);
    }

    #[test]
    fn test_handle_event_object_and_removal() {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let log = log();

        let handler = Value::new_object();
        handler.set("handleEvent", recorder(&log, "handler")).unwrap();
        listen(&document, "x", handler.clone(), Value::Undefined);
        let plain = recorder(&log, "plain");
        listen(&document, "x", plain.clone(), Value::Boolean(true));

        document.call_method("dispatchEvent", &[new_event(&global, "x", false, false)]).unwrap();
        // Wrong capture flag: nothing removed.
        document
            .call_method("removeEventListener", &[Value::from("x"), plain.clone()])
            .unwrap();
        document
            .call_method("removeEventListener", &[Value::from("x"), handler])
            .unwrap();
        document.call_method("dispatchEvent", &[new_event(&global, "x", false, false)]).unwrap();

        assert_eq!(*log.borrow(), vec!["handler", "plain", "plain"]);
    }

    #[test]
    fn test_once_and_stop_immediate() {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let log = log();

        let once = Value::new_object_with_properties([("once", Value::Boolean(true))]);
        listen(&document, "y", recorder(&log, "once"), once);
        let stopper = {
            let log = log.clone();
            Value::new_function("stopper", move |_, args| {
                log.borrow_mut().push("stopper".to_string());
                args[0].call_method("stopImmediatePropagation", &[])?;
                Ok(Value::Undefined)
            })
        };
        listen(&document, "y", stopper, Value::Undefined);
        listen(&document, "y", recorder(&log, "after"), Value::Undefined);

        for _ in 0..2 {
            document.call_method("dispatchEvent", &[new_event(&global, "y", false, false)]).unwrap();
        }
        assert_eq!(*log.borrow(), vec!["once", "stopper", "stopper"]);
    }

    #[test]
    fn test_cancel_and_redispatch() {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let errors = Rc::new(RefCell::new(Vec::new()));

        let sink = errors.clone();
        let doc = document.clone();
        let listener = Value::new_function("cancel", move |_, args| {
            args[0].call_method("preventDefault", &[])?;
            if let Err(err) = doc.call_method("dispatchEvent", &[args[0].clone()]) {
                sink.borrow_mut().push(err.kind().name());
            }
            Ok(Value::Undefined)
        });
        listen(&document, "z", listener, Value::Undefined);

        let event = new_event(&global, "z", false, false);
        let not_canceled = document.call_method("dispatchEvent", &[event.clone()]).unwrap();
        assert!(!not_canceled.to_boolean());
        assert!(event.get("defaultPrevented").to_boolean());
        assert_eq!(*errors.borrow(), vec!["InvalidStateError"]);
    }
}

mod shadow {
    use super::*;

    struct ShadowTree {
        global: Value,
        document: Value,
        host: Value,
        root: Value,
        inner: Value,
    }

    fn shadow_tree(mode: &str) -> (Rc<mercury::Window>, ShadowTree) {
        let window = manual_window();
        let global = window.global();
        let document = global.get("document");
        let html = element(&document, "html");
        let host = element(&document, "div");
        append(&document, &html);
        append(&html, &host);
        let init = Value::new_object_with_properties([("mode", Value::from(mode))]);
        let root = host.call_method("attachShadow", &[init]).unwrap();
        let inner = element(&document, "span");
        append(&root, &inner);
        (
            window,
            ShadowTree {
                global,
                document,
                host,
                root,
                inner,
            },
        )
    }

    #[test]
    fn test_composed_event_retargeted_outside_closed_tree() {
        let (_window, tree) = shadow_tree("closed");
        let seen = Rc::new(RefCell::new(Vec::new()));

        for (label, target) in [("inner", &tree.inner), ("document", &tree.document)] {
            let sink = seen.clone();
            let listener = Value::new_function(label, move |_, args| {
                let event = &args[0];
                let path = event.call_method("composedPath", &[])?.array_elements().unwrap_or_default();
                sink.borrow_mut().push((label, event.get("target"), path.len()));
                Ok(Value::Undefined)
            });
            listen(target, "poke", listener, Value::Undefined);
        }

        let event = new_event(&tree.global, "poke", true, true);
        tree.inner.call_method("dispatchEvent", &[event.clone()]).unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 2);
        let (label, target, path_len) = &seen[0];
        assert_eq!(*label, "inner");
        assert!(target.strict_equals(&tree.inner));
        assert_eq!(*path_len, 6);
        let (label, target, path_len) = &seen[1];
        assert_eq!(*label, "document");
        assert!(target.strict_equals(&tree.host));
        assert_eq!(*path_len, 4);
        // The target is cleared once dispatch from inside a shadow tree ends.
        assert!(event.get("target").is_nullish());
    }

    #[test]
    fn test_uncomposed_event_stops_at_shadow_root() {
        let (_window, tree) = shadow_tree("open");
        let log = log();
        listen(&tree.root, "local", recorder(&log, "root"), Value::Undefined);
        listen(&tree.host, "local", recorder(&log, "host"), Value::Undefined);
        listen(&tree.document, "local", recorder(&log, "document"), Value::Undefined);

        let event = new_event(&tree.global, "local", true, false);
        tree.inner.call_method("dispatchEvent", &[event]).unwrap();
        assert_eq!(*log.borrow(), vec!["root"]);
    }

    #[test]
    fn test_open_shadow_root_visible_from_host() {
        let (_window, tree) = shadow_tree("open");
        assert!(tree.host.get("shadowRoot").strict_equals(&tree.root));
        assert!(tree.inner.get("parentNode").strict_equals(&tree.root));
    }
}
