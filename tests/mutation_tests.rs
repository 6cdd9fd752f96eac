//! Integration tests for mutation observer batching and delivery

mod common;

use common::*;
use mercury::dom::{MutationObserverInit, MutationRecord, MutationType};
use mercury::{MutationObserver, Task, Value};
use std::cell::RefCell;
use std::rc::Rc;

type Batches = Rc<RefCell<Vec<Vec<MutationRecord>>>>;

fn collecting_observer() -> (Rc<MutationObserver>, Batches) {
    let batches: Batches = Rc::new(RefCell::new(Vec::new()));
    let sink = batches.clone();
    let observer = MutationObserver::host(move |records| {
        sink.borrow_mut().push(records.to_vec());
        Ok(())
    });
    (observer, batches)
}

fn child_list_subtree() -> MutationObserverInit {
    MutationObserverInit::normalize(true, None, None, true, None, None, None).unwrap()
}

#[test]
fn test_mutations_in_one_task_delivered_once() {
    let window = manual_window();
    let sched = window.scheduler().clone();
    let document = window.document();
    let (observer, batches) = collecting_observer();
    window.observe(&observer, document, child_list_subtree()).unwrap();

    let w = window.clone();
    sched.queue_macrotask(Task::host(move |_| {
        let list = w.create_element("ul");
        w.append_child(w.document(), list)?;
        for _ in 0..3 {
            let item = w.create_element("li");
            w.append_child(list, item)?;
        }
        Ok(())
    }));
    sched.run_until_idle().unwrap();

    let batches = batches.borrow();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 4);
    assert!(batches[0].iter().all(|r| r.kind == MutationType::ChildList));
}

#[test]
fn test_separate_tasks_separate_batches() {
    let window = manual_window();
    let sched = window.scheduler().clone();
    let (observer, batches) = collecting_observer();
    let element = window.create_element("div");
    window.append_child(window.document(), element).unwrap();
    let init = MutationObserverInit::normalize(false, Some(true), None, false, Some(true), None, None).unwrap();
    window.observe(&observer, element, init).unwrap();

    for value in ["a", "b"] {
        let w = window.clone();
        sched.queue_macrotask(Task::host(move |_| w.set_attribute(element, "class", value)));
    }
    sched.run_until_idle().unwrap();

    let batches = batches.borrow();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0][0].old_value, None);
    assert_eq!(batches[1][0].old_value.as_deref(), Some("a"));
    assert_eq!(batches[1][0].attribute_name.as_deref(), Some("class"));
}

#[test]
fn test_move_reports_removal_then_insertion() {
    let window = manual_window();
    let document = window.document();
    let a = window.create_element("section");
    let b = window.create_element("section");
    let item = window.create_element("p");
    window.append_child(document, a).unwrap();
    window.append_child(a, b).unwrap();
    window.append_child(a, item).unwrap();

    let (observer, batches) = collecting_observer();
    window.observe(&observer, document, child_list_subtree()).unwrap();
    window.append_child(b, item).unwrap();
    window.scheduler().run_until_idle().unwrap();

    let batches = batches.borrow();
    let records = &batches[0];
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].target, a);
    assert_eq!(records[0].removed_nodes, vec![item]);
    assert_eq!(records[0].previous_sibling, Some(b));
    assert_eq!(records[1].target, b);
    assert_eq!(records[1].added_nodes, vec![item]);
}

#[test]
fn test_observers_called_in_creation_order() {
    let window = manual_window();
    let document = window.document();
    let order = log();
    let mut observers = Vec::new();
    for name in ["first", "second"] {
        let order = order.clone();
        let observer = MutationObserver::host(move |_| {
            order.borrow_mut().push(name.to_string());
            Ok(())
        });
        observers.push(observer);
    }
    // Register in reverse; delivery still follows creation order.
    for observer in observers.iter().rev() {
        window.observe(observer, document, child_list_subtree()).unwrap();
    }
    let text = window.create_element("div");
    window.append_child(document, text).unwrap();
    window.scheduler().run_until_idle().unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second"]);
}

#[test]
fn test_uninterested_observer_not_invoked() {
    let window = manual_window();
    let document = window.document();
    let (attributes_only, attr_batches) = collecting_observer();
    let init = MutationObserverInit::normalize(false, Some(true), None, true, None, None, None).unwrap();
    window.observe(&attributes_only, document, init).unwrap();
    let (children, child_batches) = collecting_observer();
    window.observe(&children, document, child_list_subtree()).unwrap();

    let element = window.create_element("div");
    window.append_child(document, element).unwrap();
    window.scheduler().run_until_idle().unwrap();

    assert!(attr_batches.borrow().is_empty());
    assert_eq!(child_batches.borrow().len(), 1);
}

#[test]
fn test_script_observer_sees_record_wrappers() {
    let window = manual_window();
    let global = window.global();
    let document = global.get("document");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let callback = Value::new_function("observer", move |this, args| {
        let records = args[0].array_elements().unwrap_or_default();
        for record in records {
            sink.borrow_mut().push((record.get("type").to_js_string(), record.get("oldValue").to_js_string()));
        }
        // The observer is passed both as `this` and as the second argument.
        assert!(this.strict_equals(&args[1]));
        Ok(Value::Undefined)
    });
    let observer = global.call_method("MutationObserver", &[callback]).unwrap();
    let text = document.call_method("createTextNode", &[Value::from("before")]).unwrap();
    let div = document.call_method("createElement", &[Value::from("div")]).unwrap();
    document.call_method("appendChild", &[div.clone()]).unwrap();
    div.call_method("appendChild", &[text.clone()]).unwrap();

    let options = Value::new_object_with_properties([("characterDataOldValue", Value::Boolean(true))]);
    observer.call_method("observe", &[text.clone(), options]).unwrap();
    text.set("textContent", Value::from("after")).unwrap();
    window.scheduler().run_until_idle().unwrap();

    assert_eq!(*seen.borrow(), vec![("characterData".to_string(), "before".to_string())]);
}
